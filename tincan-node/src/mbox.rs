//! Mailboxes for receiving CAN messages
use defmt_or_log::warn;
use tincan_common::{
    messages::{CanId, CanMessage, NMT_CMD_ID, SYNC_ID},
    sdo::SdoRequest,
    AtomicCell, BusState,
};

use crate::pdo::Pdo;

/// Number of heartbeat producers the node can monitor (1016h subs)
pub const MAX_HEARTBEAT_CONSUMERS: usize = 4;

/// A data structure to be shared between a receiving thread (e.g. a CAN
/// controller IRQ) and the [`Node`](crate::Node) object.
///
/// Incoming messages should be passed to [NodeMbox::store_message].
/// Matching is done against the node's configured COB-IDs; everything
/// else is returned to the caller unconsumed.
#[allow(missing_debug_implementations)]
pub struct NodeMbox {
    rx_pdos: &'static [Pdo],
    sdo_cob_id: AtomicCell<Option<CanId>>,
    sdo_mbox: AtomicCell<Option<SdoRequest>>,
    nmt_mbox: AtomicCell<Option<CanMessage>>,
    sync_cob_id: AtomicCell<CanId>,
    sync_mbox: AtomicCell<Option<Option<u8>>>,
    guard_cob_id: AtomicCell<Option<CanId>>,
    guard_poll: AtomicCell<bool>,
    hb_filters: [AtomicCell<Option<CanId>>; MAX_HEARTBEAT_CONSUMERS],
    hb_mbox: [AtomicCell<Option<u8>>; MAX_HEARTBEAT_CONSUMERS],
    bus_state: AtomicCell<BusState>,
    notify_cb: AtomicCell<Option<&'static (dyn Fn() + Sync)>>,
}

impl NodeMbox {
    /// Create a new NodeMbox
    ///
    /// # Args
    ///
    /// - `rx_pdos`: A slice of Pdo objects for all of the receive PDOs
    pub const fn new(rx_pdos: &'static [Pdo]) -> Self {
        Self {
            rx_pdos,
            sdo_cob_id: AtomicCell::new(None),
            sdo_mbox: AtomicCell::new(None),
            nmt_mbox: AtomicCell::new(None),
            sync_cob_id: AtomicCell::new(SYNC_ID),
            sync_mbox: AtomicCell::new(None),
            guard_cob_id: AtomicCell::new(None),
            guard_poll: AtomicCell::new(false),
            hb_filters: [const { AtomicCell::new(None) }; MAX_HEARTBEAT_CONSUMERS],
            hb_mbox: [const { AtomicCell::new(None) }; MAX_HEARTBEAT_CONSUMERS],
            bus_state: AtomicCell::new(BusState::Active),
            notify_cb: AtomicCell::new(None),
        }
    }

    /// Set a callback for notification when a message is received and
    /// requires processing.
    ///
    /// It must be static. Usually this will be a static fn, but in some
    /// circumstances it may be desirable to use Box::leak to pass a
    /// heap allocated closure instead.
    pub fn set_process_notify_callback(&self, callback: &'static (dyn Fn() + Sync)) {
        self.notify_cb.store(Some(callback));
    }

    /// Report a bus state change from the CAN controller driver
    pub fn set_bus_state(&self, state: BusState) {
        self.bus_state.store(state);
        self.notify();
    }

    fn notify(&self) {
        if let Some(notify_cb) = self.notify_cb.load() {
            notify_cb();
        }
    }

    pub(crate) fn set_sdo_cob_id(&self, cob_id: Option<CanId>) {
        self.sdo_cob_id.store(cob_id);
    }

    pub(crate) fn set_guard_cob_id(&self, cob_id: Option<CanId>) {
        self.guard_cob_id.store(cob_id);
    }

    // 1005h is writable, so the SYNC match is a filter cell too
    pub(crate) fn set_sync_cob_id(&self, cob_id: CanId) {
        self.sync_cob_id.store(cob_id);
    }

    pub(crate) fn set_hb_filter(&self, slot: usize, cob_id: Option<CanId>) {
        if slot < MAX_HEARTBEAT_CONSUMERS {
            self.hb_filters[slot].store(cob_id);
            self.hb_mbox[slot].store(None);
        }
    }

    pub(crate) fn read_sdo_mbox(&self) -> Option<SdoRequest> {
        self.sdo_mbox.take()
    }

    pub(crate) fn read_nmt_mbox(&self) -> Option<CanMessage> {
        self.nmt_mbox.take()
    }

    pub(crate) fn read_sync_mbox(&self) -> Option<Option<u8>> {
        self.sync_mbox.take()
    }

    pub(crate) fn read_guard_poll(&self) -> bool {
        self.guard_poll.take()
    }

    pub(crate) fn read_hb_mbox(&self, slot: usize) -> Option<u8> {
        self.hb_mbox[slot].take()
    }

    pub(crate) fn bus_state(&self) -> BusState {
        self.bus_state.load()
    }

    /// Store a received CAN message
    ///
    /// Returns `Err` with the original message if it did not match any
    /// of the node's receive COB-IDs.
    pub fn store_message(&self, msg: CanMessage) -> Result<(), CanMessage> {
        let id = msg.id();
        if id == NMT_CMD_ID {
            self.nmt_mbox.store(Some(msg));
            self.notify();
            return Ok(());
        }

        if id == self.sync_cob_id.load() {
            let counter = if msg.dlc > 0 { Some(msg.data()[0]) } else { None };
            self.sync_mbox.store(Some(counter));
            self.notify();
            return Ok(());
        }

        if Some(id) == self.guard_cob_id.load() {
            if msg.rtr {
                self.guard_poll.store(true);
                self.notify();
            }
            return Ok(());
        }

        for (filter, mbox) in self.hb_filters.iter().zip(&self.hb_mbox) {
            if Some(id) == filter.load() {
                if msg.dlc >= 1 {
                    mbox.store(Some(msg.data()[0]));
                    self.notify();
                } else {
                    warn!("Short heartbeat frame from {:?}", id);
                }
                return Ok(());
            }
        }

        for rpdo in self.rx_pdos {
            if !rpdo.valid() {
                continue;
            }
            if id == rpdo.cob_id() {
                let mut data = [0u8; 8];
                data[0..msg.data().len()].copy_from_slice(msg.data());
                rpdo.buffered_value.store(Some(data));
                self.notify();
                return Ok(());
            }
        }

        if Some(id) == self.sdo_cob_id.load() {
            match SdoRequest::try_from(msg.data()) {
                Ok(req) => {
                    self.sdo_mbox.store(Some(req));
                    self.notify();
                }
                Err(_) => warn!("Malformed SDO request"),
            }
            return Ok(());
        }

        Err(msg)
    }
}
