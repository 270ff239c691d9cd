//! End-to-end engine tests against a scripted mock backend.
//!
//! The mock tokenizes at the byte level (token id == byte value) and
//! serves a fixed script of logits rows, one per sampled position, so
//! every scenario below is fully deterministic under greedy sampling.

use std::sync::{Arc, Mutex};

use parley_core::{
    DecodeBatch, Engine, EngineConfig, EngineError, GenerationConfig, Message, ModelBackend,
    Result,
};

const VOCAB: usize = 256;
const EOS: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Drop(usize, usize),
    Decode { tokens: Vec<u32>, start: usize },
    Clear,
}

struct MockBackend {
    n_ctx: usize,
    script: Vec<Vec<f32>>,
    cursor: usize,
    n_tokens: usize,
    calls: Arc<Mutex<Vec<Call>>>,
    fail_on_decode_call: Option<usize>,
    decode_calls: usize,
}

impl MockBackend {
    fn new(n_ctx: usize, script: Vec<Vec<f32>>) -> (Self, Arc<Mutex<Vec<Call>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let backend = Self {
            n_ctx,
            script,
            cursor: 0,
            n_tokens: 0,
            calls: Arc::clone(&calls),
            fail_on_decode_call: None,
            decode_calls: 0,
        };
        (backend, calls)
    }
}

impl ModelBackend for MockBackend {
    fn vocab_size(&self) -> usize {
        VOCAB
    }
    fn embed_dim(&self) -> usize {
        64
    }
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }
    fn bos_id(&self) -> Option<u32> {
        None
    }
    fn eos_id(&self) -> Option<u32> {
        Some(EOS)
    }
    fn pad_id(&self) -> Option<u32> {
        None
    }
    fn token_to_id(&self, _text: &str) -> Option<u32> {
        None
    }
    fn token_to_piece(&self, id: u32, _render_special: bool) -> String {
        if id < 256 {
            (id as u8 as char).to_string()
        } else {
            String::new()
        }
    }
    fn tokenize(&self, text: &str, _add_bos: bool, _allow_special: bool) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }
    fn decode(&mut self, batch: &DecodeBatch) -> Result<()> {
        self.decode_calls += 1;
        if self.fail_on_decode_call == Some(self.decode_calls) {
            return Err(EngineError::Decode("injected failure".into()));
        }
        self.calls.lock().unwrap().push(Call::Decode {
            tokens: batch.tokens.clone(),
            start: batch.positions[0],
        });
        self.n_tokens = batch.positions[0] + batch.tokens.len();
        if batch.logits_mask.iter().any(|&m| m) {
            self.cursor += 1;
        }
        Ok(())
    }
    fn logits_at(&self, _pos: usize) -> Result<Vec<f32>> {
        if self.cursor == 0 {
            return Err(EngineError::Decode("no logits yet".into()));
        }
        let idx = (self.cursor - 1).min(self.script.len() - 1);
        Ok(self.script[idx].clone())
    }
    fn kv_drop(&mut self, start: usize, end: usize) {
        self.calls.lock().unwrap().push(Call::Drop(start, end));
        self.n_tokens = start;
    }
    fn kv_clear(&mut self) {
        self.calls.lock().unwrap().push(Call::Clear);
        self.n_tokens = 0;
    }
}

/// A logits row whose argmax is `id`.
fn peak(id: u32) -> Vec<f32> {
    let mut row = vec![0.0; VOCAB];
    row[id as usize] = 10.0;
    row
}

fn peaks(text: &str) -> Vec<Vec<f32>> {
    text.bytes().map(|b| peak(u32::from(b))).collect()
}

fn greedy() -> GenerationConfig {
    GenerationConfig {
        temperature: 0.0,
        ..Default::default()
    }
}

fn engine_with_script(n_ctx: usize, script: Vec<Vec<f32>>) -> (Engine, Arc<Mutex<Vec<Call>>>) {
    let (backend, calls) = MockBackend::new(n_ctx, script);
    let config = EngineConfig {
        n_ctx,
        ..Default::default()
    };
    let engine = Engine::with_backend(Box::new(backend), config).unwrap();
    (engine, calls)
}

/// Token stream the engine will see for a conversation (mirrors the mock's
/// byte-level tokenizer over the ChatML rendering).
fn rendered_tokens(messages: &[Message]) -> Vec<u32> {
    parley_core::ChatTemplate::ChatMl
        .render(messages, true)
        .bytes()
        .map(u32::from)
        .collect()
}

#[test]
fn greedy_generation_decodes_the_script() {
    let mut script = peaks("Hi");
    script.push(peak(EOS));
    let (mut engine, _) = engine_with_script(4096, script);

    let messages = vec![Message::user("hello")];
    let reply = engine.generate(&messages, &greedy()).unwrap();

    assert_eq!(reply, "Hi");
    let stats = engine.stats();
    assert_eq!(stats.tokens_generated, 2);
    assert_eq!(stats.prompt_tokens, rendered_tokens(&messages).len());
    assert_eq!(stats.context_tokens, stats.prompt_tokens + 2);
}

#[test]
fn streaming_pieces_concatenate_to_the_result() {
    let mut script = peaks("Good day");
    script.push(peak(EOS));
    let (mut engine, _) = engine_with_script(4096, script);

    let events: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);

    let messages = vec![Message::user("hi")];
    let reply = engine
        .generate_stream(
            &messages,
            move |piece, is_end| {
                sink.lock().unwrap().push((piece.to_string(), is_end));
            },
            &greedy(),
        )
        .unwrap();

    let events = events.lock().unwrap();
    let concatenated: String = events
        .iter()
        .filter(|(_, is_end)| !is_end)
        .map(|(piece, _)| piece.as_str())
        .collect();
    assert_eq!(concatenated, reply);
    assert_eq!(reply, "Good day");

    // Exactly one end marker, and it comes last.
    let end_count = events.iter().filter(|(_, is_end)| *is_end).count();
    assert_eq!(end_count, 1);
    let last = events.last().unwrap();
    assert_eq!(last, &(String::new(), true));
}

#[test]
fn is_end_fires_even_when_nothing_is_generated() {
    let (mut engine, _) = engine_with_script(4096, vec![peak(EOS)]);

    let events: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);

    let reply = engine
        .generate_stream(
            &[Message::user("hi")],
            move |piece, is_end| sink.lock().unwrap().push((piece.to_string(), is_end)),
            &greedy(),
        )
        .unwrap();

    assert_eq!(reply, "");
    assert_eq!(engine.stats().tokens_generated, 0);
    let events = events.lock().unwrap();
    assert_eq!(events.as_slice(), &[(String::new(), true)]);
}

#[test]
fn second_turn_reuses_the_shared_prefix() {
    let mut script = peaks("Hi");
    script.push(peak(EOS));
    script.extend(peaks("Ok"));
    script.push(peak(EOS));
    let (mut engine, calls) = engine_with_script(4096, script);

    let turn1 = vec![Message::system("sys"), Message::user("first")];
    let reply1 = engine.generate(&turn1, &greedy()).unwrap();
    assert_eq!(reply1, "Hi");

    let n_past_after_turn1 = engine.context_usage();
    calls.lock().unwrap().clear();

    let mut turn2 = turn1.clone();
    turn2.push(Message::assistant(reply1));
    turn2.push(Message::user("second"));
    let reply2 = engine.generate(&turn2, &greedy()).unwrap();
    assert_eq!(reply2, "Ok");

    // The whole first-turn state (prompt + generated reply) is a prefix of
    // the second prompt, so nothing is dropped and only the suffix decodes.
    let calls = calls.lock().unwrap();
    assert!(!calls.iter().any(|c| matches!(c, Call::Drop(..))));
    let first_decode = calls
        .iter()
        .find_map(|c| match c {
            Call::Decode { start, .. } => Some(*start),
            _ => None,
        })
        .unwrap();
    assert_eq!(first_decode, n_past_after_turn1);
}

#[test]
fn diverging_prompt_drops_the_stale_suffix() {
    let mut script = peaks("Hi");
    script.push(peak(EOS));
    script.extend(peaks("Ok"));
    script.push(peak(EOS));
    let (mut engine, calls) = engine_with_script(4096, script);

    let turn1 = vec![Message::system("sys"), Message::user("alpha")];
    engine.generate(&turn1, &greedy()).unwrap();
    let n_past = engine.context_usage();

    calls.lock().unwrap().clear();

    let turn2 = vec![Message::system("sys"), Message::user("beta")];
    engine.generate(&turn2, &greedy()).unwrap();

    // Expected reuse: byte-level longest common prefix of the two prompts.
    let t1 = rendered_tokens(&turn1);
    let t2 = rendered_tokens(&turn2);
    let lcp = t1.iter().zip(&t2).take_while(|(a, b)| a == b).count();

    let calls = calls.lock().unwrap();
    assert_eq!(calls[0], Call::Drop(lcp, n_past));
    match &calls[1] {
        Call::Decode { tokens, start } => {
            assert_eq!(*start, lcp);
            assert_eq!(tokens, &t2[lcp..]);
        }
        other => panic!("expected suffix decode, got {other:?}"),
    }
}

#[test]
fn cancellation_stops_promptly_and_keeps_state_consistent() {
    // Endless stream of 'a' with no EOS.
    let (mut engine, _) = engine_with_script(4096, vec![peak(u32::from(b'a'))]);
    let handle = engine.stop_handle();

    let config = GenerationConfig {
        temperature: 0.0,
        max_tokens: 1000,
        ..Default::default()
    };

    let messages = vec![Message::user("go")];
    let reply = engine
        .generate_stream(
            &messages,
            move |_piece, is_end| {
                if !is_end {
                    handle.stop();
                }
            },
            &config,
        )
        .unwrap();

    let stats = engine.stats();
    assert!(
        stats.tokens_generated <= 2,
        "generated {} tokens after stop",
        stats.tokens_generated
    );
    assert!(!reply.is_empty());
    // History and cache agree: prompt plus everything actually decoded.
    assert_eq!(
        engine.context_usage(),
        stats.prompt_tokens + stats.tokens_generated
    );
}

#[test]
fn stop_sequence_truncates_the_reply() {
    // "abc</s>" triggers the default "</s>" stop sequence.
    let (mut engine, _) = engine_with_script(4096, peaks("abc</s>def"));

    let reply = engine.generate(&[Message::user("hi")], &greedy()).unwrap();
    assert_eq!(reply, "abc");
    // The matched token still reached the backend before the loop ended.
    assert_eq!(engine.stats().tokens_generated, 7);
}

#[test]
fn prompt_larger_than_context_overflows_before_decoding() {
    let (mut engine, calls) = engine_with_script(8, peaks("x"));

    let err = engine
        .generate(&[Message::user("much too long for eight tokens")], &greedy())
        .unwrap_err();
    match err {
        EngineError::ContextOverflow { prompt_tokens, n_ctx } => {
            assert!(prompt_tokens >= n_ctx);
            assert_eq!(n_ctx, 8);
        }
        other => panic!("expected ContextOverflow, got {other:?}"),
    }
    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn generation_is_capped_by_the_context_window() {
    let messages = vec![Message::user("hi")];
    let prompt_len = rendered_tokens(&messages).len();
    let n_ctx = prompt_len + 3;

    // Endless 'a', no EOS, no stop sequences.
    let (mut engine, _) = engine_with_script(n_ctx, vec![peak(u32::from(b'a'))]);
    let config = GenerationConfig {
        temperature: 0.0,
        max_tokens: 1000,
        stop_sequences: vec![],
        ..Default::default()
    };

    let reply = engine.generate(&messages, &config).unwrap();
    assert_eq!(reply.len(), 3);
    assert_eq!(engine.context_usage(), n_ctx);
}

#[test]
fn prefill_failure_surfaces_as_decode_error() {
    let (mut backend, _) = MockBackend::new(4096, peaks("x"));
    backend.fail_on_decode_call = Some(1);
    let mut engine =
        Engine::with_backend(Box::new(backend), EngineConfig::default()).unwrap();

    let err = engine.generate(&[Message::user("hi")], &greedy()).unwrap_err();
    assert!(matches!(err, EngineError::Decode(_)));
}

#[test]
fn mid_loop_decode_failure_is_fail_soft() {
    let mut script = peaks("abcdef");
    script.push(peak(EOS));
    let (mut backend, _) = MockBackend::new(4096, script);
    // Call 1 is the prefill; calls 2..4 decode 'a','b','c'; call 5 fails.
    backend.fail_on_decode_call = Some(5);
    let mut engine =
        Engine::with_backend(Box::new(backend), EngineConfig::default()).unwrap();

    let reply = engine.generate(&[Message::user("hi")], &greedy()).unwrap();
    assert_eq!(reply, "abcd");
    // The rejected fourth token is rolled back from the history.
    let stats = engine.stats();
    assert_eq!(engine.context_usage(), stats.prompt_tokens + 3);
}

#[test]
fn clear_cache_resets_backend_and_history() {
    let mut script = peaks("Hi");
    script.push(peak(EOS));
    script.extend(peaks("Ok"));
    script.push(peak(EOS));
    let (mut engine, calls) = engine_with_script(4096, script);

    let messages = vec![Message::user("hello")];
    engine.generate(&messages, &greedy()).unwrap();
    assert!(engine.context_usage() > 0);

    engine.clear_cache();
    assert_eq!(engine.context_usage(), 0);
    assert!(calls.lock().unwrap().contains(&Call::Clear));

    calls.lock().unwrap().clear();
    engine.generate(&messages, &greedy()).unwrap();
    // Full re-prefill from position zero.
    match calls.lock().unwrap().first().unwrap() {
        Call::Decode { start, .. } => assert_eq!(*start, 0),
        other => panic!("expected prefill, got {other:?}"),
    };
}

#[test]
fn session_round_trip_restores_history_for_replay() {
    let path = std::env::temp_dir().join(format!("parley-engine-session-{}", std::process::id()));

    let mut script = peaks("Hi");
    script.push(peak(EOS));
    let (mut engine, _) = engine_with_script(4096, script.clone());

    let messages = vec![Message::user("hello")];
    engine.generate(&messages, &greedy()).unwrap();
    engine.save_session(&path).unwrap();

    // Fresh engine, restored session: the cache is cleared, so the next
    // turn re-prefills from scratch rather than claiming reuse.
    let (mut restored, calls) = engine_with_script(4096, script);
    restored.load_session(&path).unwrap();
    assert!(calls.lock().unwrap().contains(&Call::Clear));
    assert_eq!(restored.context_usage(), 0);

    calls.lock().unwrap().clear();
    let reply = restored.generate(&messages, &greedy()).unwrap();
    assert_eq!(reply, "Hi");
    let calls = calls.lock().unwrap();
    assert!(!calls.iter().any(|c| matches!(c, Call::Drop(..))));
    match calls.first().unwrap() {
        Call::Decode { start, .. } => assert_eq!(*start, 0),
        other => panic!("expected full prefill, got {other:?}"),
    }

    std::fs::remove_file(&path).ok();
}

#[test]
fn tool_call_extracted_from_generated_reply() {
    let payload = "Sure!\n<function_call>{\"name\":\"play_music\",\"arguments\":{\"q\":\"jazz\"}}</function_call>";
    let mut script = peaks(payload);
    script.push(peak(EOS));
    let (mut engine, _) = engine_with_script(4096, script);

    let config = GenerationConfig {
        temperature: 0.0,
        max_tokens: 1000,
        ..Default::default()
    };
    let reply = engine.generate(&[Message::user("play jazz")], &config).unwrap();

    let call = engine.parse_function_call(&reply).unwrap();
    assert_eq!(call.name, "play_music");
    assert_eq!(call.arguments, "{\"q\":\"jazz\"}");
}

#[test]
fn prefill_is_chunked_by_n_batch() {
    let messages = vec![Message::user("a somewhat longer prompt to split")];
    let prompt_len = rendered_tokens(&messages).len();

    let (backend, calls) = MockBackend::new(4096, {
        let mut s = peaks("y");
        s.push(peak(EOS));
        s
    });
    let config = EngineConfig {
        n_batch: 16,
        ..Default::default()
    };
    let mut engine = Engine::with_backend(Box::new(backend), config).unwrap();
    engine.generate(&messages, &greedy()).unwrap();

    let calls = calls.lock().unwrap();
    let prefill_chunks: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            Call::Decode { tokens, start } if tokens.len() > 1 => Some((*start, tokens.len())),
            _ => None,
        })
        .collect();

    assert!(prefill_chunks.len() > 1, "prompt should span several chunks");
    assert!(prefill_chunks.iter().all(|(_, len)| *len <= 16));
    let covered: usize = prefill_chunks.iter().map(|(_, len)| len).sum();
    assert_eq!(covered, prompt_len);
    assert_eq!(prefill_chunks[0].0, 0);
}
