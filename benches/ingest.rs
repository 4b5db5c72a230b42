//! Performance benchmarks for a3s-inbox
//!
//! Run with: cargo bench

use a3s_inbox::channels::auth::{
    slack_signature, twilio_signature, ChannelAuth, SlackAuth, TwilioAuth, WebhookRequest,
};
use a3s_inbox::events::BroadcastSink;
use a3s_inbox::resolver::normalize_external_id;
use a3s_inbox::{
    ContactConversationResolver, Ingestor, MemoryStore, ParsedMessage, Platform,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SLACK_BODY: &[u8] = br#"{"type":"event_callback","team_id":"T1","event":{"type":"message","user":"U1","channel":"C1","text":"hello","ts":"1000.001"}}"#;

fn bench_signatures(c: &mut Criterion) {
    c.bench_function("slack_signature", |b| {
        b.iter(|| slack_signature("signing-secret", "1700000000", SLACK_BODY));
    });

    let params: BTreeMap<String, String> = [
        ("AccountSid", "AC1"),
        ("Body", "hello there"),
        ("From", "+15551234567"),
        ("MessageSid", "SM1"),
        ("To", "+15550000000"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let url = "https://inbox.example.com/webhooks/sms/u1";
    c.bench_function("twilio_signature", |b| {
        b.iter(|| twilio_signature("auth-token", url, &params));
    });

    let now = 1_700_000_000;
    let slack = SlackAuth::new("signing-secret");
    let request = WebhookRequest::new(SLACK_BODY.to_vec())
        .with_header("x-slack-request-timestamp", now.to_string())
        .with_header(
            "x-slack-signature",
            slack_signature("signing-secret", &now.to_string(), SLACK_BODY),
        );
    c.bench_function("SlackAuth verify", |b| {
        b.iter(|| slack.verify_request(&request, now));
    });

    let body = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish();
    let twilio = TwilioAuth::new("AC1", "auth-token", Some(url.to_string()));
    let request = WebhookRequest::new(body)
        .with_header("x-twilio-signature", twilio_signature("auth-token", url, &params));
    c.bench_function("TwilioAuth verify", |b| {
        b.iter(|| twilio.verify_request(&request, now));
    });
}

fn bench_normalize(c: &mut Criterion) {
    c.bench_function("normalize phone", |b| {
        b.iter(|| normalize_external_id(Platform::Sms, "+1 (555) 123-4567"));
    });
    c.bench_function("normalize email", |b| {
        b.iter(|| normalize_external_id(Platform::Email, "Jane Doe <Jane.Doe@Example.COM>"));
    });
}

fn bench_ingest(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let ingestor = Ingestor::new(
        ContactConversationResolver::new(store.clone(), store.clone(), 120),
        store,
        Arc::new(BroadcastSink::new(16)),
    );
    let seq = AtomicU64::new(0);

    c.bench_function("ingest (same thread)", |b| {
        b.to_async(&rt).iter(|| async {
            let n = seq.fetch_add(1, Ordering::Relaxed);
            let parsed = ParsedMessage::new(
                Platform::Slack,
                "U1",
                "hello",
                "C1",
                format!("slack_{}.000", n),
            );
            ingestor.ingest("u1", parsed).await.unwrap()
        });
    });
}

criterion_group!(benches, bench_signatures, bench_normalize, bench_ingest);
criterion_main!(benches);
