//! Inbound notification handling.
//!
//! Every frame from the notify characteristic is decoded to bytes, handed to
//! the protocol codec and published twice: once decoded and once raw. The
//! raw event fires even when decoding fails or the codec panics. Frames
//! that carry no bytes, including undecodable wire values, are discarded.

use futures::stream::{BoxStream, StreamExt};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::ble::codec::wire_to_bytes;
use crate::ble::transport::NotificationFrame;
use crate::events::{BleEvent, EventBus};
use crate::protocol::ProtocolCodec;

/// Decodes notification frames and publishes them on the event bus.
#[derive(Clone)]
pub struct NotificationPipeline {
    codec: Arc<dyn ProtocolCodec>,
    events: EventBus,
}

impl NotificationPipeline {
    /// Create a pipeline publishing on `events`.
    pub fn new(codec: Arc<dyn ProtocolCodec>, events: EventBus) -> Self {
        Self { codec, events }
    }

    /// Handle a single frame.
    pub fn handle_frame(&self, frame: NotificationFrame) {
        let value = match frame {
            NotificationFrame::Value(value) => value,
            NotificationFrame::Empty => {
                debug!("Discarding empty notification");
                return;
            }
            NotificationFrame::Error(e) => {
                debug!("Discarding notification error: {}", e);
                return;
            }
        };

        let bytes = wire_to_bytes(&value);
        if bytes.is_empty() {
            debug!("Discarding notification without payload");
            return;
        }
        trace!("Notification: {} bytes", bytes.len());

        match catch_unwind(AssertUnwindSafe(|| self.codec.decode(&bytes))) {
            Ok(Ok(message)) => {
                trace!("Decoded {}", message.data_type);
                self.events.publish(BleEvent::DataReceived(message));
            }
            Ok(Err(e)) => warn!("Failed to decode notification: {}", e),
            Err(_) => warn!("Protocol decoder panicked on {} byte frame", bytes.len()),
        }

        self.events.publish(BleEvent::RawDataReceived(bytes));
    }

    /// Drive the pipeline until the notification stream ends.
    pub async fn run(self, mut frames: BoxStream<'static, NotificationFrame>) {
        while let Some(frame) = frames.next().await {
            self.handle_frame(frame);
        }
        debug!("Notification stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::codec::{bytes_to_wire, WireValue};
    use crate::events::EventKind;
    use crate::protocol::{DecodedMessage, MockProtocolCodec, ProtocolError};
    use futures::stream;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn capture(bus: &EventBus) -> (Arc<Mutex<Vec<BleEvent>>>, Vec<crate::events::CallbackHandle>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handles = [EventKind::DataReceived, EventKind::RawDataReceived]
            .into_iter()
            .map(|kind| {
                let sink = seen.clone();
                bus.on(kind, move |event| sink.lock().push(event.clone()))
            })
            .collect();
        (seen, handles)
    }

    #[test]
    fn test_decoded_then_raw() {
        let mut codec = MockProtocolCodec::new();
        codec
            .expect_decode()
            .withf(|bytes| bytes.to_vec() == vec![0x10, 0x20])
            .times(1)
            .returning(|_| Ok(DecodedMessage::new("steps", serde_json::json!({ "count": 32 }))));

        let bus = EventBus::default();
        let (seen, _handles) = capture(&bus);
        let pipeline = NotificationPipeline::new(Arc::new(codec), bus);

        pipeline.handle_frame(NotificationFrame::Value(bytes_to_wire(&[0x10, 0x20])));

        assert_eq!(
            *seen.lock(),
            vec![
                BleEvent::DataReceived(DecodedMessage::new(
                    "steps",
                    serde_json::json!({ "count": 32 })
                )),
                BleEvent::RawDataReceived(vec![0x10, 0x20]),
            ]
        );
    }

    #[test]
    fn test_decode_error_still_emits_raw() {
        let mut codec = MockProtocolCodec::new();
        codec
            .expect_decode()
            .returning(|_| Err(ProtocolError::Malformed { context: "bad length".into() }));

        let bus = EventBus::default();
        let (seen, _handles) = capture(&bus);
        let pipeline = NotificationPipeline::new(Arc::new(codec), bus);

        pipeline.handle_frame(NotificationFrame::Value(WireValue::from(vec![0xff])));

        assert_eq!(*seen.lock(), vec![BleEvent::RawDataReceived(vec![0xff])]);
    }

    struct PanickingCodec;

    impl ProtocolCodec for PanickingCodec {
        fn decode(&self, _bytes: &[u8]) -> Result<DecodedMessage, ProtocolError> {
            panic!("decoder bug")
        }

        fn encode(&self, _command: &str, _args: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_decoder_panic_still_emits_raw() {
        let bus = EventBus::default();
        let (seen, _handles) = capture(&bus);
        let pipeline = NotificationPipeline::new(Arc::new(PanickingCodec), bus);

        pipeline.handle_frame(NotificationFrame::Value(WireValue::from(vec![0x01, 0x02])));

        assert_eq!(*seen.lock(), vec![BleEvent::RawDataReceived(vec![0x01, 0x02])]);
    }

    #[test]
    fn test_error_and_empty_frames_are_discarded() {
        let mut codec = MockProtocolCodec::new();
        codec.expect_decode().never();

        let bus = EventBus::default();
        let (seen, _handles) = capture(&bus);
        let pipeline = NotificationPipeline::new(Arc::new(codec), bus);

        pipeline.handle_frame(NotificationFrame::Empty);
        pipeline.handle_frame(NotificationFrame::Error("GATT error 133".into()));

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_values_without_bytes_are_discarded() {
        let mut codec = MockProtocolCodec::new();
        codec.expect_decode().never();

        let bus = EventBus::default();
        let (seen, _handles) = capture(&bus);
        let pipeline = NotificationPipeline::new(Arc::new(codec), bus);

        pipeline.handle_frame(NotificationFrame::Value(WireValue::Base64(String::new())));
        pipeline.handle_frame(NotificationFrame::Value(WireValue::Base64("not base64!".into())));
        pipeline.handle_frame(NotificationFrame::Value(WireValue::from(Vec::<u8>::new())));
        pipeline.handle_frame(NotificationFrame::Value(WireValue::Unrecognized("number".into())));

        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_preserves_frame_order() {
        let mut codec = MockProtocolCodec::new();
        codec.expect_decode().returning(|_| Err(ProtocolError::EmptyFrame));

        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let pipeline = NotificationPipeline::new(Arc::new(codec), bus);

        let frames = stream::iter(
            (1..=3u8).map(|i| NotificationFrame::Value(WireValue::from(vec![i]))),
        )
        .boxed();
        pipeline.run(frames).await;

        for i in 1..=3u8 {
            assert_eq!(rx.recv().await.unwrap(), BleEvent::RawDataReceived(vec![i]));
        }
    }
}
