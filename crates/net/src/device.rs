//! smoltcp device over in-memory frame queues.

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Frame queues between the data-plane pump and the smoltcp interface.
///
/// Inbound frames are drained from the channel into a local queue each
/// tick; outbound frames go straight onto the unbounded channel consumed
/// by the pump.
pub struct QueueDevice {
    mtu: usize,
    rx: VecDeque<Vec<u8>>,
    rx_channel: mpsc::UnboundedReceiver<Vec<u8>>,
    tx_channel: mpsc::UnboundedSender<Vec<u8>>,
    tx_buffer: Vec<u8>,
}

impl QueueDevice {
    pub fn new(
        mtu: usize,
        rx_channel: mpsc::UnboundedReceiver<Vec<u8>>,
        tx_channel: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            mtu,
            rx: VecDeque::new(),
            rx_channel,
            tx_channel,
            tx_buffer: vec![0u8; mtu + 14], // MTU + ethernet header
        }
    }

    /// Drain newly arrived frames. Call before each smoltcp poll.
    pub fn pull_rx(&mut self) {
        while let Ok(frame) = self.rx_channel.try_recv() {
            self.rx.push_back(frame);
        }
    }

    pub fn has_pending_rx(&self) -> bool {
        !self.rx.is_empty()
    }
}

impl Device for QueueDevice {
    type RxToken<'a>
        = QueueRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = QueueTxToken<'a>
    where
        Self: 'a;

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = Medium::Ethernet;
        caps
    }

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        let tx_channel = self.tx_channel.clone();
        Some((
            QueueRxToken { frame },
            QueueTxToken {
                buffer: &mut self.tx_buffer,
                tx_channel,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(QueueTxToken {
            buffer: &mut self.tx_buffer,
            tx_channel: self.tx_channel.clone(),
        })
    }
}

pub struct QueueRxToken {
    frame: Vec<u8>,
}

impl RxToken for QueueRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.frame)
    }
}

pub struct QueueTxToken<'a> {
    buffer: &'a mut Vec<u8>,
    tx_channel: mpsc::UnboundedSender<Vec<u8>>,
}

impl TxToken for QueueTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let buf = &mut self.buffer[..len];
        let result = f(buf);
        if self.tx_channel.send(buf.to_vec()).is_err() {
            tracing::trace!("dropping outbound frame, data plane detached");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_frames_flow_through_the_queue() {
        let (rx_tx, rx_rx) = mpsc::unbounded_channel();
        let (tx_tx, _tx_rx) = mpsc::unbounded_channel();
        let mut device = QueueDevice::new(1500, rx_rx, tx_tx);

        rx_tx.send(vec![1, 2, 3]).unwrap();
        assert!(!device.has_pending_rx());
        device.pull_rx();
        assert!(device.has_pending_rx());

        let (rx, _tx) = device.receive(Instant::from_millis(0)).unwrap();
        rx.consume(|frame| assert_eq!(frame, &[1, 2, 3]));
        assert!(!device.has_pending_rx());
    }

    #[test]
    fn tx_token_publishes_the_frame() {
        let (_rx_tx, rx_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (tx_tx, mut tx_rx) = mpsc::unbounded_channel();
        let mut device = QueueDevice::new(1500, rx_rx, tx_tx);

        let token = device.transmit(Instant::from_millis(0)).unwrap();
        token.consume(4, |buf| buf.copy_from_slice(&[9, 9, 9, 9]));

        assert_eq!(tx_rx.try_recv().unwrap(), vec![9, 9, 9, 9]);
    }

    #[test]
    fn capabilities_report_configured_mtu() {
        let (_a, rx) = mpsc::unbounded_channel();
        let (tx, _b) = mpsc::unbounded_channel();
        let device = QueueDevice::new(5000, rx, tx);
        assert_eq!(device.capabilities().max_transmission_unit, 5000);
    }
}
