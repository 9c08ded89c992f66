//! Error paths: rejections, sequence failures, depth violations, and the
//! format/observer hooks on both endpoints.

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::json;

use freshet::{
    consume, produce, ConsumeError, ConsumeOptions, ProduceError, ProduceOptions, Promise,
    Sequence, Value,
};

use common::*;

#[tokio::test]
async fn rejection_travels_through_format_error() {
    let data = root(
        "x",
        Value::Promise(Promise::rejected(anyhow::anyhow!("boom"))),
    );
    let observed = Arc::new(Mutex::new(Vec::new()));
    let observer = Arc::clone(&observed);

    let mut options = ProduceOptions::new(data);
    options.format_error = Some(Box::new(|error, _path| json!({"msg": error.to_string()})));
    options.on_error = Some(Box::new(move |error, path| {
        observer
            .lock()
            .unwrap()
            .push((error.to_string(), path.to_string()));
    }));

    let bytes = produce(options).unwrap();
    let text = collect_text(bytes).await;
    assert_eq!(text, "{\"x\":[[0],[null,0,0]]}\n[0,1,{\"msg\":\"boom\"}]\n");
    assert_eq!(
        observed.lock().unwrap().clone(),
        vec![("boom".to_string(), "root.x".to_string())]
    );

    let consumed = consume(replay_source(&text), ConsumeOptions::default());
    let mut head = consumed.head.await.unwrap();
    let error = expect_promise(head.remove("x").unwrap())
        .resolve()
        .await
        .unwrap_err();
    match error {
        ConsumeError::Remote { data } => assert_eq!(data, json!({"msg": "boom"})),
        other => panic!("expected Remote, got {other}"),
    }
}

#[tokio::test]
async fn default_error_format_carries_the_message() {
    let data = root(
        "x",
        Value::Promise(Promise::rejected(anyhow::anyhow!("no luck"))),
    );
    let text = collect_text(produce(ProduceOptions::new(data)).unwrap()).await;
    assert_eq!(
        text,
        "{\"x\":[[0],[null,0,0]]}\n[0,1,{\"message\":\"no luck\"}]\n"
    );
}

#[tokio::test]
async fn sequence_failure_terminates_only_that_leaf() {
    let flaky = Value::sequence(futures::stream::iter(vec![
        Ok(Value::json(1)),
        Err(anyhow::anyhow!("mid-stream failure")),
    ]));
    let mut data = root("flaky", flaky);
    data.insert(
        "solid".to_string(),
        Value::Promise(Promise::resolved(Value::json("fine"))),
    );

    let consumed = consume(
        pipe(produce(ProduceOptions::new(data)).unwrap()),
        ConsumeOptions::default(),
    );
    let mut head = consumed.head.await.unwrap();

    let mut flaky = head.remove("flaky").unwrap().into_sequence().unwrap();
    let first = flaky.next().await.unwrap().unwrap();
    assert_eq!(first.as_json(), Some(&json!(1)));
    let error = flaky.next().await.unwrap().unwrap_err();
    assert!(matches!(error, ConsumeError::Remote { .. }));
    assert!(flaky.next().await.is_none());

    // The other leaf is untouched by the failure.
    let solid = expect_promise(head.remove("solid").unwrap());
    assert_eq!(resolve_json(solid).await, json!("fine"));
}

#[tokio::test]
async fn consumer_format_error_hook_wraps_payloads() {
    let text = "{\"x\":[[0],[null,0,0]]}\n[0,1,{\"code\":451}]\n";
    let options = ConsumeOptions {
        format_error: Some(Box::new(|payload| {
            anyhow::anyhow!("remote failed with code {}", payload["code"])
        })),
        ..Default::default()
    };
    let consumed = consume(replay_source(text), options);
    let mut head = consumed.head.await.unwrap();

    let error = expect_promise(head.remove("x").unwrap())
        .resolve()
        .await
        .unwrap_err();
    match error {
        ConsumeError::Custom(e) => assert_eq!(e.to_string(), "remote failed with code 451"),
        other => panic!("expected Custom, got {other}"),
    }
}

#[tokio::test]
async fn max_depth_rejects_the_leaf_asynchronously() {
    // Depth 2 (root.box.deep) with max_depth 1: the leaf is still
    // allocated, then rejected through the normal chunk path.
    let mut entries = BTreeMap::new();
    entries.insert(
        "deep".to_string(),
        Value::Promise(Promise::resolved(Value::json(1))),
    );
    let mut options = ProduceOptions::new(root("box", Value::Object(entries)));
    options.max_depth = Some(1);

    let bytes = produce(options).unwrap();
    let text = collect_text(bytes).await;
    assert_eq!(
        text,
        "{\"box\":[[{\"deep\":0}],[\"deep\",0,0]]}\n[0,1,{\"message\":\"depth of root.box.deep exceeds max_depth 1\"}]\n"
    );
}

#[tokio::test]
async fn max_depth_fails_sequences_the_same_way() {
    let mut entries = BTreeMap::new();
    entries.insert(
        "deep".to_string(),
        Value::Sequence(Sequence::of_values(vec![Value::json(1)])),
    );
    let mut options = ProduceOptions::new(root("box", Value::Object(entries)));
    options.max_depth = Some(1);

    let text = collect_text(produce(options).unwrap()).await;
    assert_eq!(
        text,
        "{\"box\":[[{\"deep\":0}],[\"deep\",1,0]]}\n[0,2,{\"message\":\"depth of root.box.deep exceeds max_depth 1\"}]\n"
    );
}

#[tokio::test]
async fn top_level_leaves_sit_within_depth_one() {
    let mut options = ProduceOptions::new(root(
        "x",
        Value::Promise(Promise::resolved(Value::json(1))),
    ));
    options.max_depth = Some(1);
    let text = collect_text(produce(options).unwrap()).await;
    assert_eq!(text, "{\"x\":[[0],[null,0,0]]}\n[0,0,[[1]]]\n");
}

#[tokio::test]
async fn deferred_below_one_container_level_is_a_produce_error() {
    let mut inner = BTreeMap::new();
    inner.insert(
        "leaf".to_string(),
        Value::Promise(Promise::resolved(Value::json(1))),
    );
    let mut outer = BTreeMap::new();
    outer.insert("inner".to_string(), Value::Object(inner));

    let err = produce(ProduceOptions::new(root("box", Value::Object(outer)))).unwrap_err();
    match err {
        ProduceError::DeferredTooDeep { path } => {
            assert_eq!(path.to_string(), "root.box.inner.leaf");
        }
        other => panic!("expected DeferredTooDeep, got {other}"),
    }
}

#[tokio::test]
async fn resolved_value_with_deep_deferral_rejects_that_leaf() {
    // The root dehydrates fine; the violation is only discovered when the
    // promise resolves, so it becomes a leaf rejection.
    let resolves_badly = Value::promise(async {
        let mut inner = BTreeMap::new();
        inner.insert(
            "leaf".to_string(),
            Value::Promise(Promise::resolved(Value::json(1))),
        );
        let mut outer = BTreeMap::new();
        outer.insert("inner".to_string(), Value::Object(inner));
        Ok(Value::Object(outer))
    });

    let consumed = consume(
        pipe(produce(ProduceOptions::new(root("x", resolves_badly))).unwrap()),
        ConsumeOptions::default(),
    );
    let mut head = consumed.head.await.unwrap();
    let error = expect_promise(head.remove("x").unwrap())
        .resolve()
        .await
        .unwrap_err();
    match error {
        ConsumeError::Remote { data } => {
            let message = data["message"].as_str().unwrap();
            assert!(message.contains("nested beyond one container level"), "{message}");
        }
        other => panic!("expected Remote, got {other}"),
    }
}

#[tokio::test]
async fn malformed_line_interrupts_outstanding_leaves() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let observer = Arc::clone(&observed);
    let options = ConsumeOptions {
        on_error: Some(Box::new(move |error| {
            observer.lock().unwrap().push(error.to_string());
        })),
        ..Default::default()
    };

    let text = "{\"x\":[[0],[null,0,0]]}\nthis is not json\n";
    let consumed = consume(replay_source(text), options);
    let mut head = consumed.head.await.unwrap();

    let error = expect_promise(head.remove("x").unwrap())
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(error, ConsumeError::Interrupted));
    assert_eq!(observed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unexpected_status_fails_only_the_affected_leaf() {
    let text = "{\"x\":[[0],[null,0,0]],\"y\":[[0],[null,0,1]]}\n[0,7,[[1]]]\n[1,0,[[2]]]\n";
    let consumed = consume(replay_source(text), ConsumeOptions::default());
    let mut head = consumed.head.await.unwrap();

    let error = expect_promise(head.remove("x").unwrap())
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(error, ConsumeError::Protocol(_)));

    let y = expect_promise(head.remove("y").unwrap());
    assert_eq!(resolve_json(y).await, json!(2));
}
