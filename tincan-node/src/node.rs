//! The node engine
//!
//! [`Node`] ties the mailboxes, object dictionary, and protocol engines
//! together. The application constructs it once at startup and calls
//! [`Node::process`] from its main loop, passing a millisecond timestamp
//! and a frame transmit closure. Received frames are delivered
//! asynchronously through the shared [`NodeMbox`].

use defmt_or_log::{debug, info, warn};
use tincan_common::{
    messages::{
        Heartbeat, NmtCommand, NmtCommandCode, NmtState, HEARTBEAT_BASE, RPDO_BASE, SDO_REQ_BASE,
        SDO_RESP_BASE, TPDO_BASE,
    },
    sdo::AbortCode,
    BusState, CanId, CanMessage, NodeError, NodeId,
};

use crate::context::{DeviceContext, NUM_PDOS};
use crate::dict::{DictBuildError, DictBuilder, DictEntry, ObjectDict};
use crate::emcy::{codes, EmcyEngine};
use crate::mbox::{NodeMbox, MAX_HEARTBEAT_CONSUMERS};
use crate::nmt::NmtEngine;
use crate::nvm::{invalidate_params, load_params, save_params, NvmStore};
use crate::pdo::{read_pdo_data, store_pdo_data};
use crate::sdo_server::SdoServer;
use crate::sync::SyncProducer;

/// Capacity of the object dictionary table
pub const DICT_CAPACITY: usize = 96;

/// NMT startup bit making the node enter Operational on its own (1F80h)
pub const STARTUP_SELF_START: u32 = 0x4;

const STANDARD_BITRATES: [u32; 9] = [
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
];

/// Largest number of elapsed milliseconds processed in one call
const MAX_ELAPSED_TICKS: u32 = 1000;

/// Static device configuration passed to [`Node::new`]
#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    /// The node ID
    pub node_id: NodeId,
    /// CAN bitrate in bit/s; must be one of the standard CiA rates
    pub bitrate: u32,
    /// Device type (1000h)
    pub device_type: u32,
    /// Identity vendor ID (1018h sub 1)
    pub vendor_id: u32,
    /// Identity product code (1018h sub 2)
    pub product_code: u32,
    /// Identity revision number (1018h sub 3)
    pub revision: u32,
    /// Identity serial number (1018h sub 4)
    pub serial: u32,
    /// Manufacturer device name (1008h)
    pub device_name: &'static str,
    /// Manufacturer hardware version (1009h)
    pub hardware_version: &'static str,
    /// Manufacturer software version (100Ah)
    pub software_version: &'static str,
    /// Default heartbeat producer time in ms (1017h); 0 disables
    pub heartbeat_ms: u16,
    /// Enter Operational without waiting for an NMT start command
    pub self_start: bool,
}

impl StackConfig {
    /// A minimal configuration for `node_id`
    pub const fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            bitrate: 125_000,
            device_type: 0,
            vendor_id: 0,
            product_code: 0,
            revision: 0,
            serial: 0,
            device_name: "",
            hardware_version: "",
            software_version: "",
            heartbeat_ms: 0,
            self_start: false,
        }
    }
}

/// The CANopen node engine
#[allow(missing_debug_implementations)]
pub struct Node<S: NvmStore> {
    node_id: NodeId,
    bitrate: u32,
    ctx: &'static DeviceContext,
    mbox: &'static NodeMbox,
    dict: ObjectDict<DICT_CAPACITY>,
    sdo: SdoServer,
    nmt: NmtEngine,
    emcy: EmcyEngine,
    sync: SyncProducer,
    nvm: S,
    boot_pending: bool,
    last_time_ms: u32,
    last_bus_state: BusState,
}

impl<S: NvmStore> Node<S> {
    /// Create and initialize a node
    ///
    /// Registers the communication profile objects and `app_entries`
    /// into the dictionary, applies profile defaults for `config`, then
    /// restores any parameter image found in `nvm`. The boot-up frame
    /// is sent on the first [`process`](Self::process) call.
    pub fn new(
        config: StackConfig,
        ctx: &'static DeviceContext,
        mbox: &'static NodeMbox,
        app_entries: &[DictEntry<'static>],
        mut nvm: S,
    ) -> Result<Self, NodeError> {
        if !STANDARD_BITRATES.contains(&config.bitrate) {
            return Err(NodeError::InvalidBitrate {
                bitrate: config.bitrate,
            });
        }
        let node_id = config.node_id;
        let raw_id = node_id.raw() as u16;

        ctx.bind_pdos();
        let mut builder: DictBuilder<DICT_CAPACITY> = DictBuilder::new();
        builder.add_all(app_entries).map_err(map_build_error)?;
        ctx.add_entries(&mut builder).map_err(map_build_error)?;
        let dict = builder.build().map_err(map_build_error)?;

        // Profile defaults before the stored image is applied
        ctx.device_type.store(config.device_type);
        ctx.identity.set(
            config.vendor_id,
            config.product_code,
            config.revision,
            config.serial,
        );
        ctx.device_name.set_str(config.device_name.as_bytes());
        ctx.hardware_version
            .set_str(config.hardware_version.as_bytes());
        ctx.software_version
            .set_str(config.software_version.as_bytes());
        ctx.hb_producer_time.store(config.heartbeat_ms);
        ctx.nmt_startup.store(if config.self_start {
            STARTUP_SELF_START
        } else {
            0
        });
        ctx.emcy_cob
            .store(tincan_common::messages::EMCY_BASE as u32 + raw_id as u32);
        for i in 0..NUM_PDOS {
            ctx.rpdos[i].cob_id.store(CanId::std(RPDO_BASE[i] + raw_id));
            ctx.rpdos[i].valid.store(true);
            ctx.rpdos[i].transmission_type.store(254);
            ctx.tpdos[i].cob_id.store(CanId::std(TPDO_BASE[i] + raw_id));
            ctx.tpdos[i].valid.store(true);
            ctx.tpdos[i].transmission_type.store(254);
        }

        match load_params(&mut nvm, dict.entries()) {
            Ok(true) => info!("Restored parameters from NVM"),
            Ok(false) => debug!("No stored parameters, using defaults"),
            Err(e) => {
                warn!("NVM read failed: {:?}", e);
                return Err(NodeError::ParamLoad);
            }
        }

        mbox.set_sdo_cob_id(Some(CanId::std(SDO_REQ_BASE + raw_id)));
        mbox.set_guard_cob_id(Some(CanId::std(HEARTBEAT_BASE + raw_id)));
        mbox.set_sync_cob_id(ctx.sync_cob.can_id());

        let node = Self {
            node_id,
            bitrate: config.bitrate,
            ctx,
            mbox,
            dict,
            sdo: SdoServer::new(),
            nmt: NmtEngine::new(),
            emcy: EmcyEngine::new(&ctx.error_register, &ctx.emcy_history),
            sync: SyncProducer::new(),
            boot_pending: true,
            last_time_ms: 0,
            last_bus_state: BusState::Active,
            nvm,
        };
        node.update_hb_filters();
        Ok(node)
    }

    /// The configured node ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The configured CAN bitrate, for the controller driver
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// The current NMT state
    pub fn nmt_state(&self) -> NmtState {
        self.nmt.state()
    }

    /// The object dictionary table
    pub fn od(&self) -> &[DictEntry<'static>] {
        self.dict.entries()
    }

    /// The NVM backend
    pub fn nvm(&self) -> &S {
        &self.nvm
    }

    /// Mutable access to the NVM backend
    pub fn nvm_mut(&mut self) -> &mut S {
        &mut self.nvm
    }

    /// Serialize the persistent parameters and write them to the NVM
    /// backend
    ///
    /// The same operation the store command (1010h) performs, for
    /// applications that save on their own schedule.
    pub fn store_parameters(&mut self) -> Result<(), NodeError> {
        save_params(&mut self.nvm, self.dict.entries()).map_err(|_| NodeError::ParamSave)
    }

    /// Queue an application emergency
    pub fn raise_emcy(&mut self, code: u16, info: [u8; 5]) {
        self.emcy.raise(code, info);
    }

    /// Clear the error register and announce the reset on the bus
    pub fn clear_errors(&mut self) {
        self.emcy.clear();
    }

    fn update_hb_filters(&self) {
        for slot in 0..MAX_HEARTBEAT_CONSUMERS {
            let (node, time) = self.ctx.hb_consumers.slot(slot);
            let filter = if time > 0 {
                Some(CanId::std(HEARTBEAT_BASE + node as u16))
            } else {
                None
            };
            self.mbox.set_hb_filter(slot, filter);
        }
    }

    fn send_sdo_response(
        &self,
        resp: tincan_common::sdo::SdoResponse,
        send: &mut dyn FnMut(CanMessage),
    ) {
        let cob = CanId::std(SDO_RESP_BASE + self.node_id.raw() as u16);
        send(CanMessage::new(cob, &resp.to_bytes()));
    }

    fn send_tpdo(&self, idx: usize, send: &mut dyn FnMut(CanMessage)) {
        let tpdo = &self.ctx.tpdos[idx];
        let od = self.dict.entries();
        let mut data = [0u8; 8];
        let len = read_pdo_data(&mut data, tpdo, od);
        send(CanMessage::new(tpdo.cob_id(), &data[..len]));
        tpdo.clear_events(od);
        tpdo.arm_event_timer();
    }

    fn enter_operational(&mut self, send: &mut dyn FnMut(CanMessage)) {
        self.nmt.set_state(NmtState::Operational);
        // Event-driven TPDOs transmit once on entry; synchronous ones
        // stay aligned to the SYNC schedule and wait for their window
        for i in 0..NUM_PDOS {
            let tpdo = &self.ctx.tpdos[i];
            if tpdo.valid() && tpdo.transmission_type.load() >= 254 {
                tpdo.arm_event_timer();
                if tpdo.try_transmit() {
                    self.send_tpdo(i, send);
                }
            }
        }
    }

    fn handle_nmt_command(
        &mut self,
        msg: CanMessage,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), NodeError> {
        let cmd = match NmtCommand::try_from(msg) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Malformed NMT command: {:?}", e);
                return Ok(());
            }
        };
        if cmd.node != 0 && cmd.node != self.node_id.raw() {
            return Ok(());
        }
        match cmd.code {
            NmtCommandCode::Start => {
                if self.nmt.state() != NmtState::Operational {
                    self.enter_operational(send);
                }
            }
            NmtCommandCode::Stop => self.nmt.set_state(NmtState::Stopped),
            NmtCommandCode::EnterPreOp => self.nmt.set_state(NmtState::PreOperational),
            NmtCommandCode::ResetNode | NmtCommandCode::ResetComm => {
                info!("NMT reset commanded");
                return Err(NodeError::ResetRequested);
            }
        }
        Ok(())
    }

    fn handle_sync(&mut self, counter: Option<u8>, send: &mut dyn FnMut(CanMessage)) {
        if self.nmt.state() != NmtState::Operational {
            return;
        }
        let od = self.dict.entries();
        for rpdo in &self.ctx.rpdos {
            if rpdo.valid() && rpdo.transmission_type.load() <= 240 {
                if let Some(data) = rpdo.buffered_value.take() {
                    let len = rpdo.mapped_len();
                    store_pdo_data(&data[..len.min(8)], rpdo, od);
                    rpdo.received.store(true);
                }
            }
        }
        for i in 0..NUM_PDOS {
            let tpdo = &self.ctx.tpdos[i];
            if tpdo.sync_update(counter, od) && tpdo.try_transmit() {
                self.send_tpdo(i, send);
            }
        }
    }

    fn apply_event_rpdos(&mut self) {
        if self.nmt.state() != NmtState::Operational {
            return;
        }
        let od = self.dict.entries();
        for rpdo in &self.ctx.rpdos {
            if rpdo.valid() && rpdo.transmission_type.load() >= 254 {
                if let Some(data) = rpdo.buffered_value.take() {
                    let len = rpdo.mapped_len();
                    store_pdo_data(&data[..len.min(8)], rpdo, od);
                    rpdo.received.store(true);
                }
            }
        }
    }

    fn check_event_tpdos(&mut self, send: &mut dyn FnMut(CanMessage)) {
        if self.nmt.state() != NmtState::Operational {
            return;
        }
        let od = self.dict.entries();
        for i in 0..NUM_PDOS {
            let tpdo = &self.ctx.tpdos[i];
            if tpdo.valid()
                && tpdo.transmission_type.load() >= 254
                && tpdo.read_events(od)
                && tpdo.try_transmit()
            {
                self.send_tpdo(i, send);
            }
        }
    }

    fn guard_ms(&self) -> u32 {
        self.ctx.guard_time.load() as u32 * self.ctx.life_factor.load() as u32
    }

    fn run_tick(&mut self, send: &mut dyn FnMut(CanMessage)) {
        if self.nmt.hb_tick(self.ctx.hb_producer_time.load()) {
            let frame: CanMessage = Heartbeat {
                node: self.node_id.raw(),
                toggle: false,
                state: self.nmt.state(),
            }
            .into();
            send(frame);
        }
        if self.nmt.guard_tick(self.guard_ms()) {
            warn!("Node guarding lost");
            self.emcy.raise(codes::LIFEGUARD, [0; 5]);
        }
        for slot in 0..MAX_HEARTBEAT_CONSUMERS {
            let (node, time) = self.ctx.hb_consumers.slot(slot);
            if self.nmt.consumer_tick(slot, time) {
                warn!("Heartbeat from node {} lost", node);
                self.emcy.raise(codes::LIFEGUARD, [node, 0, 0, 0, 0]);
            }
        }

        let sync_value = self.ctx.sync_cob.load();
        let sync_enabled = sync_value & (1 << 30) != 0;
        if let Some(msg) = self.sync.tick(
            sync_enabled,
            self.ctx.comm_cycle.load(),
            self.ctx.sync_overflow.load(),
        ) {
            send(msg.to_can_message(self.ctx.sync_cob.can_id()));
        }

        let operational = self.nmt.state() == NmtState::Operational;
        for i in 0..NUM_PDOS {
            let tpdo = &self.ctx.tpdos[i];
            if tpdo.tick() && operational && tpdo.valid() && tpdo.try_transmit() {
                self.send_tpdo(i, send);
            }
        }

        self.emcy.tick();
        if let Some(resp) = self.sdo.on_tick() {
            self.send_sdo_response(resp, send);
        }
    }

    fn check_bus_state(&mut self) -> Result<(), NodeError> {
        let state = self.mbox.bus_state();
        if state != self.last_bus_state {
            match state {
                BusState::Warning => self.emcy.raise(codes::CAN_WARNING, [0; 5]),
                BusState::Passive => self.emcy.raise(codes::CAN_PASSIVE, [0; 5]),
                _ => {}
            }
            self.last_bus_state = state;
        }
        if state == BusState::BusOff {
            return Err(NodeError::BusOff);
        }
        Ok(())
    }

    fn resolve_pending_nvm(&mut self, send: &mut dyn FnMut(CanMessage)) {
        if self.ctx.store_cmd.take_pending() {
            let result = save_params(&mut self.nvm, self.dict.entries())
                .map_err(|_| AbortCode::HardwareError);
            if result.is_ok() {
                info!("Parameters stored");
            }
            if let Some(resp) = self.sdo.resolve_deferred(result) {
                self.send_sdo_response(resp, send);
            }
        }
        if self.ctx.restore_cmd.take_pending() {
            let result =
                invalidate_params(&mut self.nvm).map_err(|_| AbortCode::HardwareError);
            if result.is_ok() {
                info!("Stored parameters invalidated; defaults apply after reset");
            }
            if let Some(resp) = self.sdo.resolve_deferred(result) {
                self.send_sdo_response(resp, send);
            }
        }
    }

    /// Run the protocol engines
    ///
    /// `now_ms` is a monotonic millisecond timestamp; wrapping is
    /// handled. Frames to transmit are passed to `send`. Call this from
    /// the main loop whenever the mailbox notifies, and at least once
    /// per millisecond for the timers to keep pace.
    ///
    /// Returns [`NodeError::ResetRequested`] when the NMT master
    /// commands a reset; the application must drop and re-create the
    /// node. Returns [`NodeError::BusOff`] while the controller is
    /// bus-off.
    pub fn process(
        &mut self,
        now_ms: u32,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), NodeError> {
        self.check_bus_state()?;

        if self.boot_pending {
            self.boot_pending = false;
            self.last_time_ms = now_ms;
            let frame: CanMessage = Heartbeat {
                node: self.node_id.raw(),
                toggle: false,
                state: NmtState::Bootup,
            }
            .into();
            send(frame);
            let self_start = self.ctx.nmt_startup.load() & STARTUP_SELF_START != 0;
            self.nmt.boot(false);
            if self_start {
                self.enter_operational(send);
            }
            info!("Node {} booted", self.node_id.raw());
        }

        if let Some(msg) = self.mbox.read_nmt_mbox() {
            self.handle_nmt_command(msg, send)?;
        }

        if self.nmt.state() != NmtState::Stopped {
            if let Some(req) = self.mbox.read_sdo_mbox() {
                if let Some(resp) = self.sdo.handle_request(&req, self.dict.entries()) {
                    self.send_sdo_response(resp, send);
                }
            }
        }

        // 1005h is writable at runtime; keep the receive filter current
        self.mbox.set_sync_cob_id(self.ctx.sync_cob.can_id());
        if let Some(counter) = self.mbox.read_sync_mbox() {
            self.handle_sync(counter, send);
        }
        self.apply_event_rpdos();
        self.check_event_tpdos(send);

        if self.mbox.read_guard_poll() {
            let byte = self.nmt.guard_response(self.guard_ms());
            let cob = CanId::std(HEARTBEAT_BASE + self.node_id.raw() as u16);
            send(CanMessage::new(cob, &[byte]));
        }

        if self.ctx.hb_consumers.take_dirty() {
            self.update_hb_filters();
        }
        for slot in 0..MAX_HEARTBEAT_CONSUMERS {
            if self.mbox.read_hb_mbox(slot).is_some() {
                let (_, time) = self.ctx.hb_consumers.slot(slot);
                self.nmt.consumer_reset(slot, time);
            }
        }

        let elapsed = now_ms.wrapping_sub(self.last_time_ms).min(MAX_ELAPSED_TICKS);
        self.last_time_ms = now_ms;
        for _ in 0..elapsed {
            self.run_tick(send);
        }

        self.resolve_pending_nvm(send);

        let emcy_cob_value = self.ctx.emcy_cob.load();
        if emcy_cob_value & (1 << 31) == 0 {
            let cob = self.ctx.emcy_cob.can_id();
            let inhibit = self.ctx.emcy_inhibit.load();
            let state = self.nmt.state();
            self.emcy.drain(state, inhibit, &mut |msg| {
                send(msg.to_can_message(cob));
            });
        }

        Ok(())
    }
}

fn map_build_error(e: DictBuildError) -> NodeError {
    match e {
        DictBuildError::Capacity => NodeError::DictCapacity,
        DictBuildError::Duplicate { index, sub } => NodeError::DictCollision { index, sub },
    }
}
