// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Acknowledgment policy for a single delivery:
//! 1. An empty body is ignored: no handler call, no ack
//! 2. The body is decoded as the consumed type and handed to the handler
//! 3. Success is acked
//! 4. A failure the duplicate detector recognises is acked as already processed
//! 5. Any other failure, decoding included, is logged with the raw body and left
//!    unacked, so the broker redelivers it once the channel goes away

use crate::{
    codec::Codec,
    errors::{AmqpError, HandlerError},
    otel,
    topology::short_type_name,
};
use async_trait::async_trait;
use lapin::{message::Delivery, options::BasicAckOptions};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{any::type_name, borrow::Cow, future::Future, sync::Arc};
use tracing::{debug, error};

/// Number of unacknowledged deliveries a consumer may hold
pub const PREFETCH_COUNT: u16 = 2;

/// PostgreSQL message for a unique constraint violation
pub const UNIQUE_VIOLATION_MESSAGE: &str = "duplicate key value violates unique constraint";

/// Decides whether a handler failure means the message was already processed.
pub type DuplicateDetector = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

/// Matches `HandlerError::Duplicate` and failures carrying the PostgreSQL
/// unique violation message.
pub fn default_duplicate_detector() -> DuplicateDetector {
    Arc::new(|err: &HandlerError| match err {
        HandlerError::Duplicate(_) => true,
        HandlerError::Failed(msg) => msg.contains(UNIQUE_VIOLATION_MESSAGE),
    })
}

/// Processes decoded messages of type `T`.
///
/// Implemented for any `Fn(T) -> impl Future<Output = Result<(), HandlerError>>`.
#[async_trait]
pub trait ConsumerHandler<T>: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: T) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> ConsumerHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn exec(&self, _ctx: &Context, msg: T) -> Result<(), HandlerError> {
        (self)(msg).await
    }
}

/// What to do with a delivery once it was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Ignore,
    Unacked(HandlerError),
}

/// Consumer tag: `{scope}-{queue with dots as dashes}-consumer[-{number}]`.
pub fn consumer_tag(scope: &str, queue: &str, number: Option<u16>) -> String {
    let tag = format!("{}-{}-consumer", scope.to_lowercase(), queue.replace('.', "-"));

    match number {
        Some(n) => format!("{}-{}", tag, n),
        None => tag,
    }
}

pub(crate) async fn process<T, K, H>(
    ctx: &Context,
    payload: &[u8],
    codec: &K,
    handler: &H,
    is_duplicate: &DuplicateDetector,
) -> Disposition
where
    T: DeserializeOwned + Send + 'static,
    K: Codec,
    H: ConsumerHandler<T> + ?Sized,
{
    if payload.is_empty() {
        debug!("ignoring message without body");
        return Disposition::Ignore;
    }

    let result = match codec.decode::<T>(payload) {
        Ok(msg) => handler.exec(ctx, msg).await,
        Err(err) => Err(HandlerError::failed(err)),
    };

    match result {
        Ok(()) => Disposition::Ack,
        Err(err) if is_duplicate(&err) => {
            debug!(error = err.to_string(), "message already processed");
            Disposition::Ack
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                payload = %String::from_utf8_lossy(payload),
                "faulty message"
            );
            Disposition::Unacked(err)
        }
    }
}

/// Processes one delivery and acknowledges it when the policy says so.
pub(crate) async fn consume<T, K, H>(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    codec: &K,
    handler: &H,
    is_duplicate: &DuplicateDetector,
) -> Result<(), AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    K: Codec,
    H: ConsumerHandler<T> + ?Sized,
{
    let name = short_type_name(type_name::<T>());
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, name);

    debug!(
        "received: {} - exchange: {}",
        name,
        delivery.exchange.to_string(),
    );

    match process::<T, K, H>(&ctx, &delivery.data, codec, handler, is_duplicate).await {
        Disposition::Ack => match delivery.ack(BasicAckOptions { multiple: false }).await {
            Err(e) => {
                error!("error whiling ack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(AmqpError::AckMessageError)
            }
            _ => {
                span.set_status(Status::Ok);
                Ok(())
            }
        },
        Disposition::Ignore => Ok(()),
        Disposition::Unacked(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("message left unacked"),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde::{Deserialize, Serialize};
    use std::{
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct VideoUploaded {
        id: u64,
    }

    struct Recorder {
        calls: AtomicUsize,
        seen: Mutex<Vec<VideoUploaded>>,
        outcome: Result<(), HandlerError>,
    }

    impl Recorder {
        fn new(outcome: Result<(), HandlerError>) -> Self {
            Recorder {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(vec![]),
                outcome,
            }
        }
    }

    #[async_trait]
    impl ConsumerHandler<VideoUploaded> for Recorder {
        async fn exec(&self, _ctx: &Context, msg: VideoUploaded) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(msg);
            self.outcome.clone()
        }
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    async fn run(payload: &[u8], handler: &Recorder) -> Disposition {
        process::<VideoUploaded, _, _>(
            &Context::new(),
            payload,
            &JsonCodec,
            handler,
            &default_duplicate_detector(),
        )
        .await
    }

    #[test]
    fn consumer_tag_format() {
        assert_eq!(
            consumer_tag("Consumer1", "context.video", None),
            "consumer1-context-video-consumer"
        );
        assert_eq!(consumer_tag("Media", "q1", Some(3)), "media-q1-consumer-3");
    }

    #[test]
    fn parallel_consumer_tags_differ_only_by_suffix() {
        let first = consumer_tag("media", "events.video", Some(1));
        let second = consumer_tag("media", "events.video", Some(2));

        assert_ne!(first, second);
        assert_eq!(first.strip_suffix("-1"), second.strip_suffix("-2"));
    }

    #[tokio::test]
    async fn successful_handler_is_acked() {
        let handler = Recorder::new(Ok(()));

        let disposition = run(br#"{"id":42}"#, &handler).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(*handler.seen.lock().unwrap(), vec![VideoUploaded { id: 42 }]);
    }

    #[tokio::test]
    async fn duplicate_is_acked() {
        let handler = Recorder::new(Err(HandlerError::Duplicate("video 42".to_owned())));

        assert_eq!(run(br#"{"id":42}"#, &handler).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn unique_violation_message_counts_as_duplicate() {
        let handler = Recorder::new(Err(HandlerError::failed(
            "ERROR: duplicate key value violates unique constraint \"videos_pkey\"",
        )));

        assert_eq!(run(br#"{"id":42}"#, &handler).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn other_failure_stays_unacked() {
        let handler = Recorder::new(Err(HandlerError::failed("storage offline")));

        assert_eq!(
            run(br#"{"id":42}"#, &handler).await,
            Disposition::Unacked(HandlerError::Failed("storage offline".to_owned()))
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_logged_with_raw_payload() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .with_ansi(false)
            .with_max_level(tracing::Level::ERROR)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let handler = Recorder::new(Err(HandlerError::failed("storage offline")));
        run(br#"{"id":77}"#, &handler).await;

        let output = logs.contents();
        assert!(output.contains("ERROR"), "{output}");
        assert!(output.contains("faulty message"), "{output}");
        assert!(output.contains(r#"{"id":77}"#), "{output}");
        assert!(output.contains("storage offline"), "{output}");
    }

    #[tokio::test]
    async fn duplicate_is_not_logged_as_error() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .with_ansi(false)
            .with_max_level(tracing::Level::ERROR)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let handler = Recorder::new(Err(HandlerError::Duplicate("video 77".to_owned())));
        run(br#"{"id":77}"#, &handler).await;

        assert!(logs.contents().is_empty());
    }

    #[tokio::test]
    async fn empty_body_is_ignored() {
        let handler = Recorder::new(Ok(()));

        assert_eq!(run(b"", &handler).await, Disposition::Ignore);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undecodable_body_stays_unacked_without_handler_call() {
        let handler = Recorder::new(Ok(()));

        let disposition = run(b"not json", &handler).await;

        assert!(matches!(disposition, Disposition::Unacked(HandlerError::Failed(_))));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closures_are_handlers_and_detector_is_pluggable() {
        let handler = |msg: VideoUploaded| async move {
            Err::<(), HandlerError>(HandlerError::failed(format!("conflict on {}", msg.id)))
        };
        let detector: DuplicateDetector =
            Arc::new(|err: &HandlerError| err.to_string().starts_with("conflict"));

        let disposition = process::<VideoUploaded, _, _>(
            &Context::new(),
            br#"{"id":7}"#,
            &JsonCodec,
            &handler,
            &detector,
        )
        .await;

        assert_eq!(disposition, Disposition::Ack);
    }
}
