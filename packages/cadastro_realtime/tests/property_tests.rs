use futures::executor::block_on;
use futures::{StreamExt, stream};
use proptest::prelude::*;

use cadastro_realtime::config::ReconnectPolicy;
use cadastro_realtime::error::TransportError;
use cadastro_realtime::event::{EventKind, StreamEvent};
use cadastro_realtime::sse::{self, MAX_LINE_BYTES, SseFrame};

// --- SSE decoding ---

#[derive(Debug, Clone)]
struct WireFrame {
    event: String,
    data: Vec<String>,
    id: Option<String>,
    comment: Option<String>,
}

fn arb_event_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("connected".to_string()),
        Just("heartbeat".to_string()),
        Just("recordCreated".to_string()),
        Just("recordUpdated".to_string()),
        Just("recordDeleted".to_string()),
        "[a-z]{1,10}",
    ]
}

fn arb_wire_frame() -> impl Strategy<Value = WireFrame> {
    (
        arb_event_name(),
        prop::collection::vec("[a-zA-Z0-9 {}\":,]{1,16}", 1..4),
        prop::option::of("[0-9]{1,4}"),
        prop::option::of("[a-z ]{0,8}"),
    )
        .prop_map(|(event, data, id, comment)| WireFrame {
            event,
            data,
            id,
            comment,
        })
}

fn arb_line_ending() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("\n"), Just("\r\n")]
}

fn encode(frames: &[WireFrame], eol: &str) -> Vec<u8> {
    let mut out = String::new();
    for f in frames {
        if let Some(c) = &f.comment {
            out.push_str(&format!(":{c}{eol}"));
        }
        if let Some(id) = &f.id {
            out.push_str(&format!("id: {id}{eol}"));
        }
        out.push_str(&format!("event: {}{eol}", f.event));
        for line in &f.data {
            out.push_str(&format!("data: {line}{eol}"));
        }
        out.push_str(eol);
    }
    out.into_bytes()
}

fn decode_chunks(chunks: Vec<Vec<u8>>) -> Vec<SseFrame> {
    let body = stream::iter(chunks.into_iter().map(Ok::<_, TransportError>));
    block_on(sse::decode(body, MAX_LINE_BYTES).collect::<Vec<_>>())
        .into_iter()
        .filter_map(Result::ok)
        .collect()
}

proptest! {
    #[test]
    fn chunking_does_not_change_output(
        frames in prop::collection::vec(arb_wire_frame(), 0..6),
        eol in arb_line_ending(),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
    ) {
        let bytes = encode(&frames, eol);
        let expected = decode_chunks(vec![bytes.clone()]);

        let mut points: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len() + 1)).collect();
        points.sort_unstable();
        let mut chunks = Vec::new();
        let mut start = 0;
        for p in points {
            chunks.push(bytes[start..p].to_vec());
            start = p;
        }
        chunks.push(bytes[start..].to_vec());

        prop_assert_eq!(decode_chunks(chunks), expected);
    }

    #[test]
    fn decoded_frames_match_encoded(
        frames in prop::collection::vec(arb_wire_frame(), 0..6),
        eol in arb_line_ending(),
    ) {
        let decoded = decode_chunks(vec![encode(&frames, eol)]);

        prop_assert_eq!(decoded.len(), frames.len());
        let mut last_id = None;
        for (d, f) in decoded.iter().zip(&frames) {
            if f.id.is_some() {
                last_id = f.id.clone();
            }
            prop_assert_eq!(&d.event, &f.event);
            prop_assert_eq!(d.data.clone(), f.data.join("\n"));
            prop_assert_eq!(&d.id, &last_id);
        }
    }

    #[test]
    fn unknown_event_names_are_dropped(name in "[a-z]{1,12}") {
        prop_assume!(EventKind::from_wire(&name).is_none() && name != "message");
        let frame = SseFrame {
            event: name,
            data: "{not json".to_string(),
            id: None,
            retry: None,
        };
        prop_assert!(matches!(StreamEvent::from_frame(&frame), Ok(None)));
    }
}

// --- Backoff schedule ---

proptest! {
    #[test]
    fn default_backoff_matches_formula(attempt in 0u32..64) {
        let p = ReconnectPolicy::default();
        let expected = (1000u128 << attempt).min(30_000) as u64;
        prop_assert_eq!(p.delay_for(attempt).as_millis() as u64, expected);
    }

    #[test]
    fn backoff_is_monotone_and_capped(
        base in 1u64..5_000,
        extra in 0u64..120_000,
        attempt in 0u32..200,
    ) {
        let p = ReconnectPolicy {
            base_delay_ms: base,
            max_delay_ms: base + extra,
            max_attempts: 10,
        };
        let here = p.delay_for(attempt);
        let next = p.delay_for(attempt + 1);
        prop_assert!(here <= next);
        prop_assert!(next.as_millis() as u64 <= base + extra);
        prop_assert!(here.as_millis() as u64 >= base);
    }

    #[test]
    fn budget_is_exhausted_exactly_at_max(max in 0u32..50, attempt in 0u32..100) {
        let p = ReconnectPolicy {
            max_attempts: max,
            ..Default::default()
        };
        prop_assert_eq!(p.exhausted(attempt), attempt >= max);
    }
}
