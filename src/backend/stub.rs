//! Deterministic stub backends.
//!
//! These implement the backend traits without any real model weights so the
//! whole SDK (engines, memory accounting, pipeline, tests) can be exercised
//! end-to-end on any machine. They are honest about semantics: tokenization
//! round-trips, argmax decoding is bit-stable, synthesis duration tracks
//! speed, pitch moves the frequency content. A real GGUF/ONNX integration
//! replaces the [`StubFactory`] and nothing else.
//!
//! Stub model files are small text descriptors:
//!
//! ```text
//! lyra-stub-model-v1
//! kind=llm
//! context_capacity=4096
//! ```

use crate::backend::{BackendFactory, LlmBackend, SamplerParams, SttBackend, TtsBackend};
use crate::error::{ErrorCode, LyraError, Result};
use crate::stt::{Transcription, WordTiming};
use rand::distributions::{Distribution, WeightedIndex};
use std::collections::HashMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// First line of every stub model file.
pub const MODEL_MAGIC: &str = "lyra-stub-model-v1";

/// Quantization labels the stub accepts; anything else is rejected the way
/// a real backend rejects an exotic quant format.
const SUPPORTED_QUANTS: &[&str] = &["f32", "f16", "q8", "q4"];

/// Base lexicon interned into every LLM vocabulary, and used by the STT
/// stub to fabricate plausible transcripts.
const LEXICON: &[&str] = &[
    "the", "and", "of", "to", "a", "in", "it", "is", "that", "for", "was", "on", "are", "with",
    "they", "be", "at", "one", "have", "this", "from", "or", "had", "by", "not", "word", "but",
    "what", "some", "we", "can", "out", "other", "were", "all", "there", "when", "up", "use",
    "your", "how", "said", "an", "each", "she",
];

const EOS_SENTINEL: u32 = u32::MAX;

/// Declarative description of a stub model file.
#[derive(Debug, Clone)]
pub struct StubModelSpec {
    pub kind: crate::models::types::ModelKind,
    pub context_capacity: usize,
    pub quant: Option<String>,
    pub voices: Vec<String>,
    pub sample_rate: u32,
}

impl StubModelSpec {
    pub fn llm() -> Self {
        Self {
            kind: crate::models::types::ModelKind::Llm,
            context_capacity: 4096,
            quant: None,
            voices: Vec::new(),
            sample_rate: 0,
        }
    }

    pub fn llm_with_capacity(context_capacity: usize) -> Self {
        Self { context_capacity, ..Self::llm() }
    }

    pub fn stt() -> Self {
        Self {
            kind: crate::models::types::ModelKind::Stt,
            context_capacity: 0,
            quant: None,
            voices: Vec::new(),
            sample_rate: 16_000,
        }
    }

    pub fn tts() -> Self {
        Self {
            kind: crate::models::types::ModelKind::Tts,
            context_capacity: 0,
            quant: None,
            voices: vec!["amber".to_owned(), "flint".to_owned(), "willow".to_owned()],
            sample_rate: 22_050,
        }
    }

    /// Write the descriptor to disk so an engine can load it.
    ///
    /// # Errors
    ///
    /// Storage errors from the write.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut text = format!("{MODEL_MAGIC}\nkind={}\n", self.kind);
        if self.context_capacity > 0 {
            text.push_str(&format!("context_capacity={}\n", self.context_capacity));
        }
        if let Some(q) = &self.quant {
            text.push_str(&format!("quant={q}\n"));
        }
        if !self.voices.is_empty() {
            text.push_str(&format!("voices={}\n", self.voices.join(",")));
        }
        if self.sample_rate > 0 {
            text.push_str(&format!("sample_rate={}\n", self.sample_rate));
        }
        std::fs::write(path, text)
            .map_err(|e| LyraError::from_io(format!("writing {}", path.display()), &e))
    }
}

/// Parsed stub model descriptor.
struct ParsedModel {
    kind: String,
    context_capacity: usize,
    voices: Vec<String>,
    sample_rate: u32,
}

fn parse_model_file(path: &Path) -> Result<ParsedModel> {
    let bytes = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LyraError::new(
                ErrorCode::ModelFileNotFound,
                format!("model file {} does not exist", path.display()),
                format!("open of {} failed: {e}", path.display()),
            )
            .with_recovery("download the model first or fix the path")
        } else {
            LyraError::from_io(format!("opening {}", path.display()), &e)
        }
    })?;

    let corrupt = |why: &str| {
        Err(LyraError::new(
            ErrorCode::ModelFileCorrupted,
            format!("model file {} is not usable", path.display()),
            format!("{}: {why}", path.display()),
        )
        .with_recovery("delete the file and download the model again"))
    };

    let Ok(text) = std::str::from_utf8(&bytes) else {
        return corrupt("contents are not valid UTF-8");
    };
    let mut lines = text.lines();
    if lines.next() != Some(MODEL_MAGIC) {
        return corrupt("missing model header");
    }

    let mut parsed = ParsedModel {
        kind: String::new(),
        context_capacity: 2048,
        voices: Vec::new(),
        sample_rate: 22_050,
    };
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return corrupt(&format!("malformed descriptor line `{line}`"));
        };
        match key {
            "kind" => parsed.kind = value.to_owned(),
            "context_capacity" => match value.parse() {
                Ok(v) => parsed.context_capacity = v,
                Err(_) => return corrupt("context_capacity is not an integer"),
            },
            "voices" => {
                parsed.voices = value.split(',').map(|v| v.trim().to_owned()).collect();
            }
            "sample_rate" => match value.parse() {
                Ok(v) => parsed.sample_rate = v,
                Err(_) => return corrupt("sample_rate is not an integer"),
            },
            "quant" => {
                if !SUPPORTED_QUANTS.contains(&value) {
                    return Err(LyraError::new(
                        ErrorCode::ModelUnsupportedQuantization,
                        format!("model {} uses an unsupported quantization", path.display()),
                        format!("quantization `{value}` is not one of {SUPPORTED_QUANTS:?}"),
                    )
                    .with_recovery("download a variant quantized as f32, f16, q8 or q4"));
                }
            }
            _ => {} // forward compatibility: unknown keys are ignored
        }
    }
    if parsed.kind.is_empty() {
        return corrupt("descriptor does not declare a model kind");
    }
    Ok(parsed)
}

fn expect_kind(path: &Path, parsed: &ParsedModel, wanted: &str) -> Result<()> {
    if parsed.kind != wanted {
        return Err(LyraError::new(
            ErrorCode::ModelIncompatibleArchitecture,
            format!("model {} is not a {wanted} model", path.display()),
            format!("descriptor declares kind `{}`, engine expected `{wanted}`", parsed.kind),
        )
        .with_recovery("load this model with the matching engine"));
    }
    Ok(())
}

/// Default factory producing stub backends.
#[derive(Debug, Default)]
pub struct StubFactory;

impl BackendFactory for StubFactory {
    fn open_llm(&self, path: &Path) -> Result<Box<dyn LlmBackend>> {
        let parsed = parse_model_file(path)?;
        expect_kind(path, &parsed, "llm")?;
        debug!(path = %path.display(), capacity = parsed.context_capacity, "stub LLM opened");
        Ok(Box::new(StubLlm::new(parsed.context_capacity)))
    }

    fn open_stt(&self, path: &Path) -> Result<Box<dyn SttBackend>> {
        let parsed = parse_model_file(path)?;
        expect_kind(path, &parsed, "stt")?;
        Ok(Box::new(StubStt))
    }

    fn open_tts(&self, path: &Path) -> Result<Box<dyn TtsBackend>> {
        let parsed = parse_model_file(path)?;
        expect_kind(path, &parsed, "tts")?;
        let voices = if parsed.voices.is_empty() {
            StubModelSpec::tts().voices
        } else {
            parsed.voices
        };
        Ok(Box::new(StubTts { voices, sample_rate: parsed.sample_rate }))
    }
}

/// Mixes two ids into a pseudo-random but fully deterministic score.
fn hash_score(a: u64, b: u64) -> f32 {
    let mut x = a
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(b.wrapping_mul(0xbf58_476d_1ce4_e5b9))
        .wrapping_add(0x94d0_49bb_1331_11eb);
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    (x >> 40) as f32 / (1u64 << 24) as f32
}

/// Word-level LLM over an interned vocabulary.
pub struct StubLlm {
    vocab: Vec<String>,
    index: HashMap<String, u32>,
    capacity: usize,
    usage: usize,
}

impl StubLlm {
    pub fn new(capacity: usize) -> Self {
        let mut llm = Self {
            vocab: Vec::new(),
            index: HashMap::new(),
            capacity,
            usage: 0,
        };
        for word in LEXICON {
            llm.intern(word);
        }
        llm
    }

    fn intern(&mut self, word: &str) -> u32 {
        if let Some(&id) = self.index.get(word) {
            return id;
        }
        let id = self.vocab.len() as u32;
        self.vocab.push(word.to_owned());
        self.index.insert(word.to_owned(), id);
        id
    }

    /// Raw next-token logit for `candidate` after `prev`.
    fn logit(prev: u64, candidate: u64) -> f32 {
        hash_score(prev, candidate) * 10.0
    }
}

impl LlmBackend for StubLlm {
    fn context_capacity(&self) -> usize {
        self.capacity
    }

    fn context_usage(&self) -> usize {
        self.usage
    }

    fn tokenize(&mut self, text: &str) -> Result<Vec<u32>> {
        Ok(text.split_whitespace().map(|w| self.intern(w)).collect())
    }

    fn detokenize(&self, tokens: &[u32]) -> Result<String> {
        let mut words = Vec::with_capacity(tokens.len());
        for &t in tokens {
            match self.vocab.get(t as usize) {
                Some(w) => words.push(w.as_str()),
                None => {
                    return Err(LyraError::new(
                        ErrorCode::InferenceInvalidInput,
                        format!("token id {t} is not in this model's vocabulary"),
                        format!("detokenize received id {t}, vocabulary size is {}", self.vocab.len()),
                    )
                    .with_recovery("only pass token ids produced by tokenize on this handle"));
                }
            }
        }
        Ok(words.join(" "))
    }

    fn generate(
        &mut self,
        prompt_tokens: &[u32],
        params: &SamplerParams,
        on_token: &mut dyn FnMut(&str) -> bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>> {
        let mut emitted: Vec<u32> = Vec::new();
        let mut text_so_far = String::new();
        let mut prev = prompt_tokens.last().copied().unwrap_or(EOS_SENTINEL) as u64;
        let mut rng = rand::thread_rng();

        'steps: for step in 0..params.max_tokens {
            if cancel.is_cancelled() {
                return Err(LyraError::cancelled("text generation"));
            }

            // Score every vocabulary entry plus an end-of-sequence option
            // whose appeal grows with the output length.
            let mut scored: Vec<(u32, f32)> = (0..self.vocab.len() as u32)
                .map(|cand| {
                    let mut logit = Self::logit(prev, cand as u64);
                    if emitted.contains(&cand) || prompt_tokens.contains(&cand) {
                        logit /= params.repetition_penalty;
                    }
                    (cand, logit)
                })
                .collect();
            // EOS starts unattractive and gains appeal as the output grows,
            // so argmax runs terminate on their own eventually.
            let eos_logit =
                hash_score(prev, EOS_SENTINEL as u64) * 4.0 + step as f32 * 0.15;
            scored.push((EOS_SENTINEL, eos_logit));

            let choice = if params.temperature == 0.0 {
                // Argmax; ties resolve to the lowest id for stability.
                scored
                    .iter()
                    .copied()
                    .max_by(|a, b| {
                        a.1.partial_cmp(&b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(b.0.cmp(&a.0))
                    })
                    .map(|(id, _)| id)
                    .unwrap_or(EOS_SENTINEL)
            } else {
                sample_token(&mut scored, params, &mut rng)
            };

            if choice == EOS_SENTINEL {
                break;
            }

            let word = self.vocab[choice as usize].clone();
            let piece = if emitted.is_empty() {
                word.clone()
            } else {
                format!(" {word}")
            };
            let candidate_text = format!("{text_so_far}{piece}");

            // Stop sequences halt generation; the match is never emitted.
            if params
                .stop_sequences
                .iter()
                .any(|s| !s.is_empty() && candidate_text.contains(s.as_str()))
            {
                break 'steps;
            }

            if !on_token(&piece) {
                break;
            }
            emitted.push(choice);
            text_so_far = candidate_text;
            prev = choice as u64;
        }

        self.usage = (prompt_tokens.len() + emitted.len()).min(self.capacity);
        Ok(emitted)
    }

    fn reset(&mut self) {
        self.usage = 0;
    }
}

/// Temperature sampling with nucleus and top-k filtering.
fn sample_token(
    scored: &mut [(u32, f32)],
    params: &SamplerParams,
    rng: &mut impl rand::Rng,
) -> u32 {
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cutoff = scored.len();
    if params.top_k > 0 {
        cutoff = cutoff.min(params.top_k as usize);
    }
    let kept = &scored[..cutoff.max(1)];

    // Softmax over the kept candidates at the requested temperature.
    let max_logit = kept[0].1;
    let temperature = params.temperature.max(1e-4);
    let weights: Vec<f32> = kept
        .iter()
        .map(|(_, l)| ((l - max_logit) / temperature).exp())
        .collect();

    // Nucleus: keep the smallest prefix covering top_p probability mass.
    let total: f32 = weights.iter().sum();
    let mut nucleus_len = kept.len();
    if params.top_p < 1.0 {
        let mut acc = 0.0;
        for (i, w) in weights.iter().enumerate() {
            acc += w / total;
            if acc >= params.top_p {
                nucleus_len = i + 1;
                break;
            }
        }
    }
    let nucleus_len = nucleus_len.max(1);

    match WeightedIndex::new(&weights[..nucleus_len]) {
        Ok(dist) => kept[dist.sample(rng)].0,
        Err(_) => kept[0].0,
    }
}

/// Energy-profile speech-to-text.
pub struct StubStt;

impl SttBackend for StubStt {
    fn transcribe(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        language: &str,
        want_words: bool,
    ) -> Result<Transcription> {
        let window = (sample_rate as usize / 10).max(1);
        let voiced_threshold = 0.02f32;

        // Group consecutive voiced 100 ms windows into "words".
        let mut words: Vec<WordTiming> = Vec::new();
        let mut run_start: Option<usize> = None;
        let mut run_energy = 0.0f32;
        let mut run_windows = 0usize;
        let window_count = samples.len().div_ceil(window);

        for idx in 0..window_count {
            let lo = idx * window;
            let hi = (lo + window).min(samples.len());
            let rms = rms_energy(&samples[lo..hi]);
            if rms >= voiced_threshold {
                if run_start.is_none() {
                    run_start = Some(idx);
                    run_energy = 0.0;
                    run_windows = 0;
                }
                run_energy += rms;
                run_windows += 1;
            } else if let Some(start) = run_start.take() {
                words.push(word_for_run(words.len(), start, idx, run_energy / run_windows as f32));
            }
        }
        if let Some(start) = run_start {
            words.push(word_for_run(
                words.len(),
                start,
                window_count,
                run_energy / run_windows as f32,
            ));
        }

        let text = words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let confidence = if words.is_empty() {
            0.0
        } else {
            words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32
        };
        let language = if language.is_empty() { "en".to_owned() } else { language.to_owned() };

        Ok(Transcription {
            text,
            confidence: confidence.clamp(0.0, 1.0),
            language,
            words: if want_words { words } else { Vec::new() },
        })
    }
}

fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

fn word_for_run(index: usize, start_window: usize, end_window: usize, mean_energy: f32) -> WordTiming {
    let pick = hash_score(index as u64, end_window as u64 - start_window as u64);
    let word = LEXICON[(pick * LEXICON.len() as f32) as usize % LEXICON.len()];
    WordTiming {
        text: word.to_owned(),
        start_time_s: start_window as f32 * 0.1,
        end_time_s: end_window as f32 * 0.1,
        confidence: (0.6 + mean_energy * 1.5).clamp(0.0, 0.99),
    }
}

/// Tone-synthesis text-to-speech.
pub struct StubTts {
    voices: Vec<String>,
    sample_rate: u32,
}

impl TtsBackend for StubTts {
    fn voices(&self) -> Vec<String> {
        self.voices.clone()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        speed: f32,
        pitch: f32,
        on_chunk: &mut dyn FnMut(&[f32]) -> bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        if !self.voices.iter().any(|v| v == voice) {
            return Err(LyraError::new(
                ErrorCode::InvalidInputParameterValue,
                format!("voice `{voice}` is not available in this model"),
                format!("available voices are {:?}", self.voices),
            )
            .with_recovery("pick a voice from get_available_voices"));
        }

        let voice_seed = voice.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let voice_shift = 1.0 + hash_score(voice_seed, 7) * 0.2;
        let base_freq = 160.0 * 2.0f32.powf(pitch) * voice_shift;
        let rate = self.sample_rate as f32;

        let mut all = Vec::new();
        for (i, word) in text.split_whitespace().enumerate() {
            if cancel.is_cancelled() {
                return Err(LyraError::cancelled("speech synthesis"));
            }

            let word_seed = word.bytes().fold(0u64, |acc, b| acc.wrapping_mul(131).wrapping_add(b as u64));
            let freq = base_freq * (1.0 + hash_score(word_seed, i as u64) * 0.15);
            let voiced_s = (0.09 + 0.02 * word.len().min(12) as f32) / speed;
            let gap_s = 0.04 / speed;

            let voiced_n = ((voiced_s * rate) as usize).max(1);
            let gap_n = (gap_s * rate) as usize;
            let mut chunk = Vec::with_capacity(voiced_n + gap_n);
            for n in 0..voiced_n {
                let t = n as f32 / rate;
                let envelope = tone_envelope(n, voiced_n);
                chunk.push((2.0 * std::f32::consts::PI * freq * t).sin() * 0.3 * envelope);
            }
            chunk.extend(std::iter::repeat_n(0.0, gap_n));

            if !on_chunk(&chunk) {
                return Ok(all);
            }
            all.extend_from_slice(&chunk);
        }
        Ok(all)
    }
}

/// Linear attack/decay over the first and last tenth of a tone.
fn tone_envelope(n: usize, total: usize) -> f32 {
    let edge = (total / 10).max(1);
    if n < edge {
        n as f32 / edge as f32
    } else if n + edge > total {
        (total - n) as f32 / edge as f32
    } else {
        1.0
    }
}
