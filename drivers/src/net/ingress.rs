//! Receive-side hand-off from drivers to the protocol stack.
//!
//! The stack registers one sink function; drivers push every received
//! [`PacketBuf`] through [`deliver_rx`].  Until a sink exists packets are
//! dropped and the caller told so, which it records as an RX drop.

use core::sync::atomic::{AtomicPtr, Ordering};

use super::packetbuf::PacketBuf;
use super::types::DevIndex;

/// A sink consumes the packet; there is no hand-back.
pub type RxSink = fn(DevIndex, PacketBuf);

static RX_SINK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Register the stack's receive entry point.  Last registration wins.
pub fn register_rx_sink(sink: RxSink) {
    RX_SINK.store(sink as *mut (), Ordering::Release);
}

/// Remove the sink; subsequent deliveries drop.
pub fn clear_rx_sink() {
    RX_SINK.store(core::ptr::null_mut(), Ordering::Release);
}

/// Push one received packet up.  Returns `false` if no sink is registered
/// and the packet was dropped.
pub fn deliver_rx(dev: DevIndex, pkt: PacketBuf) -> bool {
    let ptr = RX_SINK.load(Ordering::Acquire);
    if ptr.is_null() {
        drop(pkt);
        return false;
    }
    // SAFETY: only `register_rx_sink` stores here, and it stores a valid
    // `RxSink` function pointer.
    let sink: RxSink = unsafe { core::mem::transmute(ptr) };
    sink(dev, pkt);
    true
}
