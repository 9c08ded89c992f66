//! Interruption: transport cuts, local aborts, and producer-side
//! cancellation when the consumer walks away.

mod common;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::timeout;

use freshet::{consume, produce, ConsumeError, ConsumeOptions, ProduceOptions, Value};

use common::*;

#[tokio::test]
async fn cut_stream_rejects_unresolved_promises() {
    let (tx, source) = channel_source();
    let consumed = consume(source, ConsumeOptions::default());

    send_text(&tx, "{\"x\":[[0],[null,0,0]]}\n");
    let mut head = consumed.head.await.unwrap();

    // Cut the transport before the chunk arrives.
    drop(tx);

    let error = expect_promise(head.remove("x").unwrap())
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(error, ConsumeError::Interrupted));
}

#[tokio::test]
async fn cut_stream_fails_sequences_on_next_iteration() {
    let (tx, source) = channel_source();
    let consumed = consume(source, ConsumeOptions::default());

    send_text(&tx, "{\"xs\":[[0],[null,1,0]]}\n[0,1,[[1]]]\n");
    let mut head = consumed.head.await.unwrap();
    let mut xs = head.remove("xs").unwrap().into_sequence().unwrap();

    let first = xs.next().await.unwrap().unwrap();
    assert_eq!(first.as_json(), Some(&json!(1)));

    drop(tx);

    let error = xs.next().await.unwrap().unwrap_err();
    assert!(matches!(error, ConsumeError::Interrupted));
    assert!(xs.next().await.is_none());
}

#[tokio::test]
async fn stream_ending_before_head_rejects_the_head() {
    let (tx, source) = channel_source();
    let consumed = consume(source, ConsumeOptions::default());
    drop(tx);

    let error = consumed.head.await.unwrap_err();
    assert!(matches!(error, ConsumeError::Interrupted));
}

#[tokio::test]
async fn transport_errors_interrupt_like_a_cut() {
    let (tx, source) = channel_source();
    let consumed = consume(source, ConsumeOptions::default());

    send_text(&tx, "{\"x\":[[0],[null,0,0]]}\n");
    let mut head = consumed.head.await.unwrap();

    tx.unbounded_send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        .unwrap();
    drop(tx);

    let error = expect_promise(head.remove("x").unwrap())
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(error, ConsumeError::Interrupted));
}

#[tokio::test]
async fn abort_interrupts_locally() {
    let (tx, source) = channel_source();
    let mut consumed = consume(source, ConsumeOptions::default());

    send_text(&tx, "{\"x\":[[0],[null,0,0]]}\n");
    let mut head = (&mut consumed.head).await.unwrap();

    consumed.abort();

    let error = expect_promise(head.remove("x").unwrap())
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(error, ConsumeError::Interrupted));
}

#[tokio::test]
async fn residual_without_newline_is_discarded() {
    let (tx, source) = channel_source();
    let consumed = consume(source, ConsumeOptions::default());

    // The final chunk line never got its terminator; a well-formed stream
    // ends with one, so the fragment must not be interpreted.
    send_text(&tx, "{\"x\":[[0],[null,0,0]]}\n[0,0,[[7]");
    drop(tx);

    let mut head = consumed.head.await.unwrap();
    let error = expect_promise(head.remove("x").unwrap())
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(error, ConsumeError::Interrupted));
}

struct DropFlag(Arc<Notify>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

#[tokio::test]
async fn dropping_the_byte_stream_cancels_sequence_work() {
    let released = Arc::new(Notify::new());
    let flag = DropFlag(Arc::clone(&released));

    // A sequence that never yields; the flag drops only when the codec
    // drops the stream itself.
    type SeqItem = Result<Value, anyhow::Error>;
    let endless = futures::stream::unfold(flag, |flag| async move {
        let _flag = flag;
        futures::future::pending::<Option<(SeqItem, DropFlag)>>().await
    });

    let mut bytes = produce(ProduceOptions::new(root("xs", Value::sequence(endless)))).unwrap();
    let head_line = next_line(&mut bytes).await;
    assert_eq!(head_line, "{\"xs\":[[0],[null,1,0]]}\n");

    drop(bytes);

    timeout(Duration::from_secs(5), released.notified())
        .await
        .expect("sequence was not dropped after cancellation");
}

#[tokio::test]
async fn dropping_the_byte_stream_cancels_promise_work() {
    let released = Arc::new(Notify::new());
    let flag = DropFlag(Arc::clone(&released));

    let stuck = Value::promise(async move {
        let _flag = flag;
        futures::future::pending::<()>().await;
        Ok(Value::json(0))
    });

    let mut bytes = produce(ProduceOptions::new(root("x", stuck))).unwrap();
    let _head = next_line(&mut bytes).await;
    drop(bytes);

    timeout(Duration::from_secs(5), released.notified())
        .await
        .expect("promise was not dropped after cancellation");
}

#[tokio::test]
async fn still_pending_promise_resolves_interrupted_after_partial_stream() {
    // One leaf terminal arrives, the other never does; only the second is
    // interrupted.
    let (tx, source) = channel_source();
    let consumed = consume(source, ConsumeOptions::default());

    send_text(
        &tx,
        "{\"a\":[[0],[null,0,0]],\"b\":[[0],[null,0,1]]}\n[0,0,[[\"done\"]]]\n",
    );
    let mut head = consumed.head.await.unwrap();

    let a = expect_promise(head.remove("a").unwrap());
    assert_eq!(resolve_json(a).await, json!("done"));

    drop(tx);

    let error = expect_promise(head.remove("b").unwrap())
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(error, ConsumeError::Interrupted));
}
