//! End-to-end tests driving a node through its CAN-facing interface

use tincan_node::common::messages::{NmtState, SYNC_ID};
use tincan_node::common::objects::{PdoMapping, SubInfo};
use tincan_node::common::sdo::{AbortCode, SdoRequest, SdoResponse};
use tincan_node::common::{CanId, CanMessage, NodeError, NodeId};
use tincan_node::dict::{DictEntry, ScalarCell};
use tincan_node::nvm::{ArrayNvm, NVM_IMAGE_SIZE};
use tincan_node::{DeviceContext, Node, NodeMbox, StackConfig};

const NODE_ID: u8 = 5;

struct Fixture {
    node: Node<ArrayNvm<NVM_IMAGE_SIZE>>,
    mbox: &'static NodeMbox,
    ctx: &'static DeviceContext,
    value8: &'static ScalarCell<u8>,
    value16: &'static ScalarCell<u16>,
}

fn base_config() -> StackConfig {
    let mut config = StackConfig::new(NodeId::new(NODE_ID).unwrap());
    config.vendor_id = 0xCAFE;
    config.product_code = 0x1234;
    config.device_name = "test node";
    config
}

fn setup(config: StackConfig) -> Fixture {
    setup_with_nvm(config, ArrayNvm::new())
}

fn setup_with_nvm(config: StackConfig, nvm: ArrayNvm<NVM_IMAGE_SIZE>) -> Fixture {
    let ctx: &'static DeviceContext = Box::leak(Box::new(DeviceContext::new()));
    let mbox: &'static NodeMbox = Box::leak(Box::new(NodeMbox::new(&ctx.rpdos)));
    let value8 = Box::leak(Box::new(ScalarCell::<u8>::new(0)));
    let value16 = Box::leak(Box::new(ScalarCell::<u16>::new(0)));
    let entries = [
        DictEntry::raw(
            0x2000,
            0,
            SubInfo::new_u8().rw().mappable(PdoMapping::Both),
            value8,
        ),
        DictEntry::raw(
            0x2001,
            0,
            SubInfo::new_u16().rw().mappable(PdoMapping::Both),
            value16,
        ),
    ];
    let node = Node::new(config, ctx, mbox, &entries, nvm).unwrap();
    Fixture {
        node,
        mbox,
        ctx,
        value8,
        value16,
    }
}

fn run(fixture: &mut Fixture, now_ms: u32) -> Vec<CanMessage> {
    let mut sent = Vec::new();
    fixture
        .node
        .process(now_ms, &mut |msg| sent.push(msg))
        .unwrap();
    sent
}

fn sdo_exchange(fixture: &mut Fixture, now_ms: u32, req: SdoRequest) -> SdoResponse {
    fixture
        .mbox
        .store_message(CanMessage::new(
            CanId::std(0x600 + NODE_ID as u16),
            &req.to_bytes(),
        ))
        .unwrap();
    let sent = run(fixture, now_ms);
    let resp = sent
        .iter()
        .find(|m| m.id() == CanId::std(0x580 + NODE_ID as u16))
        .expect("no SDO response");
    SdoResponse::try_from(resp.data()).unwrap()
}

fn sdo_write_u32(fixture: &mut Fixture, now_ms: u32, index: u16, sub: u8, value: u32) {
    let resp = sdo_exchange(
        fixture,
        now_ms,
        SdoRequest::expedited_download(index, sub, &value.to_le_bytes()),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(index, sub));
}

fn start_node(fixture: &mut Fixture, now_ms: u32) -> Vec<CanMessage> {
    fixture
        .mbox
        .store_message(CanMessage::new(CanId::Std(0), &[1, NODE_ID]))
        .unwrap();
    run(fixture, now_ms)
}

#[test]
fn boot_up_frame_and_preoperational() {
    let mut fixture = setup(base_config());
    let sent = run(&mut fixture, 0);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id(), CanId::std(0x700 + NODE_ID as u16));
    assert_eq!(sent[0].data(), &[0x00]);
    assert_eq!(fixture.node.nmt_state(), NmtState::PreOperational);
}

#[test]
fn self_start_enters_operational() {
    let mut config = base_config();
    config.self_start = true;
    let mut fixture = setup(config);
    let sent = run(&mut fixture, 0);
    assert_eq!(sent[0].data(), &[0x00]);
    assert_eq!(fixture.node.nmt_state(), NmtState::Operational);
}

#[test]
fn sdo_reads_identity() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    let resp = sdo_exchange(&mut fixture, 0, SdoRequest::initiate_upload(0x1018, 1));
    assert_eq!(
        resp,
        SdoResponse::expedited_upload(0x1018, 1, &0xCAFEu32.to_le_bytes())
    );
}

#[test]
fn sdo_reads_device_name_segmented() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    let resp = sdo_exchange(&mut fixture, 0, SdoRequest::initiate_upload(0x1008, 0));
    assert_eq!(resp, SdoResponse::upload_acknowledge(0x1008, 0, 9));
    let resp = sdo_exchange(&mut fixture, 0, SdoRequest::upload_segment(false));
    assert_eq!(resp, SdoResponse::upload_segment(false, false, b"test no"));
    let resp = sdo_exchange(&mut fixture, 0, SdoRequest::upload_segment(true));
    assert_eq!(resp, SdoResponse::upload_segment(true, true, b"de"));
}

#[test]
fn emcy_cob_id_rejects_reserved_value() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1014, 0, &0u32.to_le_bytes()),
    );
    assert_eq!(
        resp,
        SdoResponse::abort(0x1014, 0, AbortCode::InvalidValue)
    );
    // The old value is untouched
    assert_eq!(fixture.ctx.emcy_cob.load(), 0x80 + NODE_ID as u32);
}

#[test]
fn nmt_start_transmits_event_tpdos() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);

    // Map 0x2000 into TPDO1; the mapping is frozen while the PDO is
    // valid, so disable it first
    let tpdo1_cob = 0x180 + NODE_ID as u32;
    sdo_write_u32(&mut fixture, 0, 0x1800, 1, tpdo1_cob | 1 << 31);
    sdo_write_u32(&mut fixture, 0, 0x1A00, 1, 0x2000_0008);
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1A00, 0, &[1]),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1A00, 0));
    sdo_write_u32(&mut fixture, 0, 0x1800, 1, tpdo1_cob);

    fixture.value8.set(0xAB);
    let sent = start_node(&mut fixture, 0);
    assert_eq!(fixture.node.nmt_state(), NmtState::Operational);
    let tpdo = sent
        .iter()
        .find(|m| m.id() == CanId::std(0x180 + NODE_ID as u16))
        .expect("no TPDO1 transmission");
    assert_eq!(tpdo.data(), &[0xAB]);
}

#[test]
fn rpdo_applies_split_mapping() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);

    let rpdo1_cob = 0x200 + NODE_ID as u32;
    sdo_write_u32(&mut fixture, 0, 0x1400, 1, rpdo1_cob | 1 << 31);
    sdo_write_u32(&mut fixture, 0, 0x1600, 1, 0x2000_0008);
    sdo_write_u32(&mut fixture, 0, 0x1600, 2, 0x2001_0010);
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1600, 0, &[2]),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1600, 0));
    sdo_write_u32(&mut fixture, 0, 0x1400, 1, rpdo1_cob);
    start_node(&mut fixture, 0);

    fixture
        .mbox
        .store_message(CanMessage::new(
            CanId::std(0x200 + NODE_ID as u16),
            &[0x11, 0x22, 0x33],
        ))
        .unwrap();
    run(&mut fixture, 0);
    assert_eq!(fixture.value8.load(), 0x11);
    assert_eq!(fixture.value16.load(), 0x3322);
    assert!(fixture.ctx.rpdos[0].take_received());
    assert!(!fixture.ctx.rpdos[0].take_received());
}

#[test]
fn rpdos_ignored_outside_operational() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    let rpdo1_cob = 0x200 + NODE_ID as u32;
    sdo_write_u32(&mut fixture, 0, 0x1400, 1, rpdo1_cob | 1 << 31);
    sdo_write_u32(&mut fixture, 0, 0x1600, 1, 0x2000_0008);
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1600, 0, &[1]),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1600, 0));
    sdo_write_u32(&mut fixture, 0, 0x1400, 1, rpdo1_cob);

    // Still Pre-Operational: the frame is buffered but not applied
    fixture
        .mbox
        .store_message(CanMessage::new(CanId::std(0x200 + NODE_ID as u16), &[0x42]))
        .unwrap();
    run(&mut fixture, 0);
    assert_eq!(fixture.value8.load(), 0);
}

#[test]
fn store_and_restore_parameters() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);

    // Change the heartbeat time, then store with the "save" magic
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1017, 0, &500u16.to_le_bytes()),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1017, 0));
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1010, 1, &u32::to_le_bytes(0x6576_6173)),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1010, 1));

    // A new node constructed over the same storage sees the stored value
    let nvm = fixture.node.nvm().clone();
    let fixture2 = setup_with_nvm(base_config(), nvm);
    assert_eq!(fixture2.ctx.hb_producer_time.load(), 500);
}

#[test]
fn stored_pdo_mapping_restores_on_boot() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);

    let tpdo1_cob = 0x180 + NODE_ID as u32;
    sdo_write_u32(&mut fixture, 0, 0x1800, 1, tpdo1_cob | 1 << 31);
    sdo_write_u32(&mut fixture, 0, 0x1A00, 1, 0x2000_0008);
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1A00, 0, &[1]),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1A00, 0));
    sdo_write_u32(&mut fixture, 0, 0x1800, 1, tpdo1_cob);
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1010, 1, &u32::to_le_bytes(0x6576_6173)),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1010, 1));

    // The rebooted node comes up with the mapping applied and the PDO
    // active
    let nvm = fixture.node.nvm().clone();
    let fixture2 = setup_with_nvm(base_config(), nvm);
    assert_eq!(fixture2.ctx.tpdos[0].mapping_params[0].load(), 0x2000_0008);
    assert_eq!(fixture2.ctx.tpdos[0].valid_maps.load(), 1);
    assert!(fixture2.ctx.tpdos[0].valid());
}

#[test]
fn application_store_parameters() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    fixture.ctx.hb_producer_time.store(300);
    fixture.node.store_parameters().unwrap();

    let nvm = fixture.node.nvm().clone();
    let fixture2 = setup_with_nvm(base_config(), nvm);
    assert_eq!(fixture2.ctx.hb_producer_time.load(), 300);
}

#[test]
fn store_parameters_without_backend_fails() {
    let ctx: &'static DeviceContext = Box::leak(Box::new(DeviceContext::new()));
    let mbox: &'static NodeMbox = Box::leak(Box::new(NodeMbox::new(&ctx.rpdos)));
    let mut node = Node::new(base_config(), ctx, mbox, &[], ()).unwrap();
    assert_eq!(node.store_parameters(), Err(NodeError::ParamSave));
}

#[test]
fn store_rejects_wrong_magic() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1010, 1, &u32::to_le_bytes(0xDEAD_BEEF)),
    );
    assert_eq!(resp, SdoResponse::abort(0x1010, 1, AbortCode::CantStore));
}

#[test]
fn restore_invalidates_stored_image() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1017, 0, &250u16.to_le_bytes()),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1017, 0));
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1010, 1, &u32::to_le_bytes(0x6576_6173)),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1010, 1));
    // "load" wipes the image; defaults apply on the next boot
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1011, 1, &u32::to_le_bytes(0x64616F6C)),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1011, 1));

    let nvm = fixture.node.nvm().clone();
    let fixture2 = setup_with_nvm(base_config(), nvm);
    assert_eq!(fixture2.ctx.hb_producer_time.load(), 0);
}

#[test]
fn heartbeat_production() {
    let mut config = base_config();
    config.heartbeat_ms = 100;
    let mut fixture = setup(config);
    run(&mut fixture, 0);
    let sent = run(&mut fixture, 200);
    let heartbeats: Vec<_> = sent
        .iter()
        .filter(|m| m.id() == CanId::std(0x700 + NODE_ID as u16))
        .collect();
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].data(), &[NmtState::PreOperational as u8]);
}

#[test]
fn node_guard_toggle_and_lifeguard_event() {
    let mut fixture = setup(base_config());
    fixture.ctx.guard_time.store(10);
    fixture.ctx.life_factor.store(2);
    run(&mut fixture, 0);

    let guard_cob = CanId::std(0x700 + NODE_ID as u16);
    fixture
        .mbox
        .store_message(CanMessage::new_rtr(guard_cob, 1))
        .unwrap();
    let sent = run(&mut fixture, 0);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data(), &[0x7F]);

    fixture
        .mbox
        .store_message(CanMessage::new_rtr(guard_cob, 1))
        .unwrap();
    let sent = run(&mut fixture, 0);
    assert_eq!(sent[0].data(), &[0xFF]);

    // Master stops polling: lifeguard EMCY after guard_time * life_factor
    let sent = run(&mut fixture, 25);
    let emcy = sent
        .iter()
        .find(|m| m.id() == CanId::std(0x80 + NODE_ID as u16))
        .expect("no lifeguard EMCY");
    assert_eq!(&emcy.data()[0..2], &0x8130u16.to_le_bytes());
}

#[test]
fn heartbeat_consumer_timeout_raises_emcy() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    // Monitor node 10 with a 50 ms timeout
    sdo_write_u32(&mut fixture, 0, 0x1016, 1, (10 << 16) | 50);

    fixture
        .mbox
        .store_message(CanMessage::new(CanId::std(0x70A), &[0x05]))
        .unwrap();
    let sent = run(&mut fixture, 0);
    assert!(sent.is_empty());

    // Producer goes silent
    let sent = run(&mut fixture, 60);
    let emcy = sent
        .iter()
        .find(|m| m.id() == CanId::std(0x80 + NODE_ID as u16))
        .expect("no heartbeat timeout EMCY");
    assert_eq!(&emcy.data()[0..2], &0x8130u16.to_le_bytes());
    assert_eq!(emcy.data()[3], 10);

    // A new heartbeat rearms; no repeated EMCY until the next silence
    fixture
        .mbox
        .store_message(CanMessage::new(CanId::std(0x70A), &[0x05]))
        .unwrap();
    let sent = run(&mut fixture, 80);
    assert!(sent.is_empty());
}

#[test]
fn sync_triggers_cyclic_tpdo() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    let tpdo1_cob = 0x180 + NODE_ID as u32;
    sdo_write_u32(&mut fixture, 0, 0x1800, 1, tpdo1_cob | 1 << 31);
    sdo_write_u32(&mut fixture, 0, 0x1A00, 1, 0x2000_0008);
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1A00, 0, &[1]),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1A00, 0));
    sdo_write_u32(&mut fixture, 0, 0x1800, 1, tpdo1_cob);
    // Transmit on every second SYNC
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1800, 2, &[2]),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1800, 2));
    start_node(&mut fixture, 0);
    fixture.value8.store(0x5A);

    fixture
        .mbox
        .store_message(CanMessage::new(SYNC_ID, &[]))
        .unwrap();
    let sent = run(&mut fixture, 0);
    assert!(sent.iter().all(|m| m.id() != CanId::std(0x185)));

    fixture
        .mbox
        .store_message(CanMessage::new(SYNC_ID, &[]))
        .unwrap();
    let sent = run(&mut fixture, 0);
    let tpdo = sent
        .iter()
        .find(|m| m.id() == CanId::std(0x180 + NODE_ID as u16))
        .expect("no sync TPDO");
    assert_eq!(tpdo.data(), &[0x5A]);
}

#[test]
fn sync_consumed_on_configured_cob_id() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    let tpdo1_cob = 0x180 + NODE_ID as u32;
    sdo_write_u32(&mut fixture, 0, 0x1800, 1, tpdo1_cob | 1 << 31);
    sdo_write_u32(&mut fixture, 0, 0x1A00, 1, 0x2000_0008);
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1A00, 0, &[1]),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1A00, 0));
    sdo_write_u32(&mut fixture, 0, 0x1800, 1, tpdo1_cob);
    let resp = sdo_exchange(
        &mut fixture,
        0,
        SdoRequest::expedited_download(0x1800, 2, &[1]),
    );
    assert_eq!(resp, SdoResponse::download_acknowledge(0x1800, 2));
    // Move SYNC consumption off the default identifier
    sdo_write_u32(&mut fixture, 0, 0x1005, 0, 0x90);
    start_node(&mut fixture, 0);
    fixture.value8.store(0x77);

    // The default identifier no longer matches
    assert!(fixture
        .mbox
        .store_message(CanMessage::new(SYNC_ID, &[]))
        .is_err());
    fixture
        .mbox
        .store_message(CanMessage::new(CanId::std(0x90), &[]))
        .unwrap();
    let sent = run(&mut fixture, 0);
    let tpdo = sent
        .iter()
        .find(|m| m.id() == CanId::std(0x180 + NODE_ID as u16))
        .expect("no sync TPDO");
    assert_eq!(tpdo.data(), &[0x77]);
}

#[test]
fn sdo_ignored_in_stopped_state() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    fixture
        .mbox
        .store_message(CanMessage::new(CanId::Std(0), &[2, NODE_ID]))
        .unwrap();
    run(&mut fixture, 0);
    assert_eq!(fixture.node.nmt_state(), NmtState::Stopped);

    fixture
        .mbox
        .store_message(CanMessage::new(
            CanId::std(0x600 + NODE_ID as u16),
            &SdoRequest::initiate_upload(0x1018, 1).to_bytes(),
        ))
        .unwrap();
    let sent = run(&mut fixture, 0);
    assert!(sent.is_empty());
}

#[test]
fn nmt_reset_returns_error() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    fixture
        .mbox
        .store_message(CanMessage::new(CanId::Std(0), &[129, 0]))
        .unwrap();
    let mut sent = Vec::new();
    let result = fixture.node.process(0, &mut |msg| sent.push(msg));
    assert_eq!(result, Err(NodeError::ResetRequested));
}

#[test]
fn application_emcy_and_error_reset() {
    let mut fixture = setup(base_config());
    run(&mut fixture, 0);
    fixture.node.raise_emcy(0x2310, [1, 2, 3, 4, 5]);
    let sent = run(&mut fixture, 0);
    let emcy = sent
        .iter()
        .find(|m| m.id() == CanId::std(0x80 + NODE_ID as u16))
        .expect("no EMCY frame");
    assert_eq!(&emcy.data()[0..2], &0x2310u16.to_le_bytes());
    // Current class bits plus generic
    assert_eq!(emcy.data()[2], 0x03);
    assert_eq!(&emcy.data()[3..8], &[1, 2, 3, 4, 5]);

    // The error lands in 1003h
    let resp = sdo_exchange(&mut fixture, 0, SdoRequest::initiate_upload(0x1003, 0));
    assert_eq!(resp, SdoResponse::expedited_upload(0x1003, 0, &[1]));

    fixture.node.clear_errors();
    let sent = run(&mut fixture, 0);
    let emcy = sent
        .iter()
        .find(|m| m.id() == CanId::std(0x80 + NODE_ID as u16))
        .expect("no reset EMCY frame");
    assert_eq!(&emcy.data()[0..2], &[0, 0]);
    assert_eq!(emcy.data()[2], 0);
}
