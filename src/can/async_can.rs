//! Async wrapper for Adapters implementing the [`CanAdapter`] trait.

use std::collections::{HashMap, VecDeque};

use crate::can::CanAdapter;
use crate::can::Frame;
use crate::Stream;
use async_stream::stream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

const CAN_TX_BUFFER_SIZE: usize = 128;
const CAN_RX_BUFFER_SIZE: usize = 1024;
const DEBUG: bool = false;

/// Echoes are matched on the numeric address, the firmware picks the frame format on its own.
type BusIdentifier = (u8, u32);
type FrameCallback = (Frame, oneshot::Sender<()>);

fn process<T: CanAdapter>(
    mut adapter: T,
    mut shutdown_receiver: oneshot::Receiver<()>,
    rx_sender: broadcast::Sender<Frame>,
    mut tx_receiver: mpsc::Receiver<(Frame, oneshot::Sender<()>)>,
) {
    let mut buffer: VecDeque<Frame> = VecDeque::new();
    let mut callbacks: HashMap<BusIdentifier, VecDeque<FrameCallback>> = HashMap::new();

    while shutdown_receiver.try_recv().is_err() {
        let frames: Vec<Frame> = match adapter.recv() {
            Ok(frames) => frames,
            Err(e) => {
                error!("Error receiving frames, stopping IO thread: {}", e);
                break;
            }
        };

        for frame in frames {
            if DEBUG {
                debug! {"RX {:?}", frame};
            }

            // Wake up sender. Frames blocked by the safety model come back as well.
            if frame.loopback || frame.rejected {
                let callback = callbacks
                    .entry((frame.bus, frame.id.into()))
                    .or_default()
                    .pop_front();

                match callback {
                    Some((tx_frame, callback)) => {
                        // Frames are echoed in the order they were sent, per bus and identifier
                        if tx_frame.data != frame.data {
                            warn!("Echo does not match sent frame: {:?} != {:?}", frame, tx_frame);
                        }
                        if frame.rejected {
                            warn!("Frame rejected by safety model: {:?}", frame);
                        }
                        // Sender might have given up waiting
                        let _ = callback.send(());
                    }
                    None => warn!("Received loopback frame with no pending callback: {:?}", frame),
                };
            }

            // No receivers is fine, nobody is listening yet
            let _ = rx_sender.send(frame);
        }

        while let Ok((frame, callback)) = tx_receiver.try_recv() {
            // Insert callback into hashmap
            callbacks
                .entry((frame.bus, frame.id.into()))
                .or_default()
                .push_back((frame.clone(), callback));

            if DEBUG {
                debug! {"TX {:?}", frame};
            }

            buffer.push_back(frame);
        }
        if !buffer.is_empty() {
            if let Err(e) = adapter.send(&mut buffer) {
                error!("Error sending frames, stopping IO thread: {}", e);
                break;
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

/// Async wrapper around a [`CanAdapter`]. Starts a background thread to handle sending and receiving frames. Uses tokio channels to communicate with the background thread.
pub struct AsyncCanAdapter {
    processing_handle: Option<std::thread::JoinHandle<()>>,
    recv_receiver: broadcast::Receiver<Frame>,
    send_sender: mpsc::Sender<(Frame, oneshot::Sender<()>)>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl AsyncCanAdapter {
    pub fn new<T: CanAdapter + Send + 'static>(adapter: T) -> Self {
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        let (send_sender, send_receiver) = mpsc::channel(CAN_TX_BUFFER_SIZE);
        let (recv_sender, recv_receiver) = broadcast::channel(CAN_RX_BUFFER_SIZE);

        let mut ret = AsyncCanAdapter {
            shutdown: Some(shutdown_sender),
            processing_handle: None,
            recv_receiver,
            send_sender,
        };

        ret.processing_handle = Some(std::thread::spawn(move || {
            process(adapter, shutdown_receiver, recv_sender, send_receiver);
        }));

        ret
    }

    /// Send a single frame. The Future resolves once the adapter has echoed the frame back, meaning it was put on the bus or rejected by the safety model.
    pub async fn send(&self, frame: &Frame) -> Result<(), crate::error::Error> {
        // Create oneshot channel to signal the completion of the send operation
        let (callback_sender, callback_receiver) = oneshot::channel();
        self.send_sender
            .send((frame.clone(), callback_sender))
            .await
            .map_err(|_| crate::error::Error::Disconnected)?;

        callback_receiver
            .await
            .map_err(|_| crate::error::Error::Disconnected)
    }

    /// Receive all frames.
    pub fn recv(&self) -> impl Stream<Item = Frame> {
        self.recv_filter(|_| true)
    }

    /// Receive frames that match a filter. Useful in combination with stream adapters.
    pub fn recv_filter(&self, filter: impl Fn(&Frame) -> bool) -> impl Stream<Item = Frame> {
        let mut rx = self.recv_receiver.resubscribe();

        Box::pin(stream! {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if filter(&frame) {
                            yield frame
                        } else {
                            continue
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for AsyncCanAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.processing_handle.take() {
            // Send shutdown signal to background tread. It may already have stopped on its own.
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
            if handle.join().is_err() {
                error!("CAN IO thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::Identifier;
    use crate::StreamExt;

    /// Adapter that echoes every frame it is handed, like a panda with loopback enabled.
    struct EchoAdapter {
        pending: Vec<Frame>,
    }

    impl CanAdapter for EchoAdapter {
        fn send(&mut self, frames: &mut VecDeque<Frame>) -> Result<(), crate::error::Error> {
            while let Some(mut frame) = frames.pop_front() {
                frame.loopback = true;
                self.pending.push(frame);
            }
            Ok(())
        }

        fn recv(&mut self) -> Result<Vec<Frame>, crate::error::Error> {
            Ok(std::mem::take(&mut self.pending))
        }
    }

    #[tokio::test]
    async fn send_resolves_on_echo() {
        let adapter = AsyncCanAdapter::new(EchoAdapter { pending: vec![] });
        let mut stream = adapter.recv_filter(|frame| frame.loopback);

        let frame = Frame::new(0, 0x123.into(), &[1, 2, 3]).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), adapter.send(&frame))
            .await
            .unwrap()
            .unwrap();

        let echo = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echo.id, frame.id);
        assert_eq!(echo.data, frame.data);
        assert!(echo.loopback);
    }

    /// Adapter that echoes frames after a trip through the panda wire format.
    struct CodecEchoAdapter {
        pending: Vec<u8>,
    }

    impl CanAdapter for CodecEchoAdapter {
        fn send(&mut self, frames: &mut VecDeque<Frame>) -> Result<(), crate::error::Error> {
            let frames: Vec<Frame> = frames.drain(..).collect();
            for chunk in crate::panda::usb_protocol::pack_can_buffer(&frames)? {
                self.pending.extend(chunk);
            }
            Ok(())
        }

        fn recv(&mut self) -> Result<Vec<Frame>, crate::error::Error> {
            let mut frames = crate::panda::usb_protocol::unpack_can_buffer(&mut self.pending)?;
            for frame in frames.iter_mut() {
                frame.loopback = true;
            }
            Ok(frames)
        }
    }

    #[tokio::test]
    async fn send_resolves_on_echo_with_other_format() {
        let adapter = AsyncCanAdapter::new(CodecEchoAdapter { pending: vec![] });

        // Comes back as a standard frame, the address fits in 11 bits
        let frame = Frame::new(0, Identifier::Extended(0x123), &[1, 2, 3]).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), adapter.send(&frame))
            .await
            .unwrap()
            .unwrap();

        let frame = Frame::new(1, Identifier::Extended(0x18daf110), &[4, 5]).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), adapter.send(&frame))
            .await
            .unwrap()
            .unwrap();
    }
}
