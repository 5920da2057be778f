//! Kokoro ONNX speech model: text → phonemes → tokens → f32 audio (24kHz).
//!
//! Pipeline:
//! 1. Text → sentences (split on .!? followed by whitespace)
//! 2. Sentence → phonemes (misaki-rs G2P)
//! 3. Phonemes → token IDs (tokenizer.json vocabulary)
//! 4. Token IDs + voice style + speed → ONNX inference → samples
//!
//! Sentences are concatenated with a short silence so one request yields one
//! WAV file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use ort::value::Tensor;
use tracing::{debug, info, warn};

use crate::backend::{create_audio_tmp_dir, write_wav, VoiceParams};
use crate::config::LocalConfig;
use crate::error::DaemonError;

pub const SAMPLE_RATE: u32 = 24000;
const MAX_TOKENS: usize = 510; // Voice style array first dimension
const SENTENCE_GAP_SECS: f32 = 0.12;
const STYLE_DIM: usize = 256;

/// Anything that turns text into mono samples. The daemon owns exactly one.
pub trait SpeechModel: Send {
    fn synthesize(&mut self, text: &str, params: &VoiceParams) -> Result<Vec<f32>, String>;

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

/// Style vectors indexed by token count. shape: (510, 256)
struct VoiceData {
    styles: Array2<f32>,
}

pub struct KokoroEngine {
    session: ort::session::Session,
    phonemizer: misaki_rs::G2P,
    vocab: HashMap<char, i64>,
    voices: HashMap<String, VoiceData>,
}

impl KokoroEngine {
    /// Load tokenizer, voices, ONNX model and phonemizer. Blocking.
    pub fn load(config: &LocalConfig) -> Result<Self, DaemonError> {
        let t0 = Instant::now();

        let tokenizer_path = config.tokenizer_path();
        info!("Loading tokenizer from {}", tokenizer_path.display());
        let vocab = load_tokenizer(&tokenizer_path).map_err(DaemonError::ModelLoad)?;

        let voices_path = config.voices_path();
        info!("Loading voices from {}", voices_path.display());
        let voices = load_voices(&voices_path).map_err(DaemonError::ModelLoad)?;
        info!("Loaded {} voices", voices.len());

        let model_path = config.model_path();
        info!("Loading ONNX model from {}", model_path.display());
        let session = ort::session::Session::builder()
            .map_err(|e| DaemonError::ModelLoad(format!("session builder: {e}")))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| DaemonError::ModelLoad(format!("optimization level: {e}")))?
            .with_intra_threads(config.intra_threads.max(1))
            .map_err(|e| DaemonError::ModelLoad(format!("thread count: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| DaemonError::ModelLoad(format!("{}: {e}", model_path.display())))?;

        let phonemizer = misaki_rs::G2P::new(misaki_rs::Language::EnglishUS);

        info!("Kokoro loaded in {}ms", t0.elapsed().as_millis());
        Ok(Self {
            session,
            phonemizer,
            vocab,
            voices,
        })
    }

    fn tokenize(&self, phonemes: &str) -> Vec<i64> {
        let mut ids = Vec::with_capacity(phonemes.len() + 2);
        ids.push(0);
        ids.extend(phonemes.chars().filter_map(|ch| self.vocab.get(&ch).copied()));
        ids.push(0);
        ids.truncate(MAX_TOKENS);
        ids
    }

    fn infer(&mut self, sentence: &str, voice: &str, speed: f32) -> Result<Vec<f32>, String> {
        let (phonemes, _tokens) = self
            .phonemizer
            .g2p(sentence)
            .map_err(|e| format!("Phonemization failed: {e}"))?;
        if phonemes.is_empty() {
            return Ok(Vec::new());
        }

        let token_ids = self.tokenize(&phonemes);
        let n_tokens = token_ids.len();

        let voice_data = self
            .voices
            .get(voice)
            .ok_or_else(|| format!("Voice not found: {voice}"))?;
        if voice_data.styles.nrows() == 0 {
            return Err(format!("Voice has no style vectors: {voice}"));
        }
        let style_idx = n_tokens
            .saturating_sub(2)
            .min(voice_data.styles.nrows().saturating_sub(1));
        let style_vec: Vec<f32> = voice_data.styles.row(style_idx).to_vec();

        let tokens = Tensor::from_array(
            Array2::from_shape_vec((1, n_tokens), token_ids).map_err(|e| format!("tokens tensor: {e}"))?,
        )
        .map_err(|e| format!("tokens tensor: {e}"))?;
        let style = Tensor::from_array(
            Array2::from_shape_vec((1, STYLE_DIM), style_vec).map_err(|e| format!("style tensor: {e}"))?,
        )
        .map_err(|e| format!("style tensor: {e}"))?;
        let speed = Tensor::from_array(ndarray::Array1::from_vec(vec![speed]))
            .map_err(|e| format!("speed tensor: {e}"))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "tokens" => tokens,
                "style" => style,
                "speed" => speed
            ])
            .map_err(|e| format!("ONNX inference failed: {e}"))?;

        let first = outputs.iter().next().ok_or("No output tensor from model")?;
        let (_shape, audio) = first
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("Failed to extract audio tensor: {e}"))?;

        Ok(audio.to_vec())
    }
}

impl SpeechModel for KokoroEngine {
    fn synthesize(&mut self, text: &str, params: &VoiceParams) -> Result<Vec<f32>, String> {
        if !self.voices.contains_key(&params.voice) {
            return Err(format!("Unknown voice: {}", params.voice));
        }
        if params.lang != "a" {
            debug!("Language hint '{}' served by the en-US phonemizer", params.lang);
        }

        let sentences = split_sentences(text.trim());
        let gap = vec![0.0f32; (SAMPLE_RATE as f32 * SENTENCE_GAP_SECS) as usize];
        let mut samples = Vec::new();

        for (i, sentence) in sentences.iter().enumerate() {
            let t = Instant::now();
            let chunk = self.infer(sentence, &params.voice, params.speed)?;
            debug!(
                "Sentence {}/{}: {} samples in {}ms",
                i + 1,
                sentences.len(),
                chunk.len(),
                t.elapsed().as_millis()
            );
            if chunk.is_empty() {
                continue;
            }
            if !samples.is_empty() {
                samples.extend_from_slice(&gap);
            }
            samples.extend(chunk);
        }

        Ok(samples)
    }
}

/// Synthesize into a fresh per-request temp dir and return the WAV path.
/// The sample buffer is dropped before returning.
pub fn render_to_wav(model: &mut dyn SpeechModel, text: &str, params: &VoiceParams) -> Result<PathBuf, String> {
    let samples = model.synthesize(text, params)?;
    if samples.is_empty() {
        return Err("model produced no audio".to_string());
    }

    let dir = create_audio_tmp_dir().map_err(|e| format!("Failed to create temp dir: {e}"))?;
    let path = dir.join("speech.wav");
    if let Err(e) = write_wav(&path, &samples, model.sample_rate()) {
        if let Err(rm) = fs::remove_dir_all(&dir) {
            warn!("Failed to remove {}: {rm}", dir.display());
        }
        return Err(format!("Failed to write WAV: {e}"));
    }
    Ok(path)
}

/// Load tokenizer vocabulary from tokenizer.json.
fn load_tokenizer(path: &Path) -> Result<HashMap<char, i64>, String> {
    let contents = fs::read_to_string(path).map_err(|e| format!("Failed to read tokenizer: {e}"))?;
    let data: serde_json::Value =
        serde_json::from_str(&contents).map_err(|e| format!("Failed to parse tokenizer JSON: {e}"))?;

    let vocab = data["model"]["vocab"]
        .as_object()
        .ok_or("Missing model.vocab in tokenizer.json")?;

    let mut map = HashMap::new();
    for (token, id) in vocab {
        let id = id.as_i64().ok_or("Token ID is not an integer")?;
        if let Some(ch) = token.chars().next() {
            map.insert(ch, id);
        }
    }
    Ok(map)
}

/// Load all voice styles from an NPZ file. Each entry is (510, 1, 256).
fn load_voices(path: &Path) -> Result<HashMap<String, VoiceData>, String> {
    let file = fs::File::open(path).map_err(|e| format!("Failed to open voices file: {e}"))?;
    let mut npz = NpzReader::new(file).map_err(|e| format!("Failed to read NPZ voices file: {e}"))?;

    let names = npz.names().map_err(|e| format!("Failed to list NPZ entries: {e}"))?;
    let mut voices = HashMap::new();
    for entry in names {
        let name = entry.trim_end_matches(".npy").to_string();
        let arr: Array3<f32> = npz
            .by_name(&entry)
            .map_err(|e| format!("Failed to read voice '{name}': {e}"))?;

        let styles = voice_styles(&name, arr)?;
        voices.insert(name, VoiceData { styles });
    }
    Ok(voices)
}

/// Flatten a (n, 1, 256) voice array into n style rows. Empty voices are rejected.
fn voice_styles(name: &str, arr: Array3<f32>) -> Result<Array2<f32>, String> {
    let (rows, dim) = (arr.shape()[0], arr.shape()[2]);
    if rows == 0 || dim != STYLE_DIM || arr.shape()[1] != 1 {
        return Err(format!("Voice '{name}' has unexpected shape {:?}", arr.shape()));
    }
    arr.into_shape_with_order((rows, dim))
        .map_err(|e| format!("Failed to reshape voice '{name}': {e}"))
}

/// Split text into sentences at .!? followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') && bytes.get(i + 1).is_some_and(|n| n.is_ascii_whitespace()) {
            let s = text[start..=i].trim();
            if !s.is_empty() {
                sentences.push(s);
            }
            start = i + 1;
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tone;

    impl SpeechModel for Tone {
        fn synthesize(&mut self, text: &str, _params: &VoiceParams) -> Result<Vec<f32>, String> {
            Ok(vec![0.25; text.len() * 100])
        }
    }

    fn params() -> VoiceParams {
        VoiceParams {
            voice: "bf_lily".into(),
            speed: 1.0,
            lang: "b".into(),
        }
    }

    #[test]
    fn splits_on_terminal_punctuation() {
        assert_eq!(
            split_sentences("Hi there. How are you? Fine!"),
            vec!["Hi there.", "How are you?", "Fine!"]
        );
        assert_eq!(split_sentences("v1.2 is out"), vec!["v1.2 is out"]);
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn render_writes_a_wav_in_a_temp_dir() {
        let path = render_to_wav(&mut Tone, "Hello.", &params()).unwrap();
        assert!(crate::backend::is_audio_tmp_dir(path.parent().unwrap()));
        let clip = crate::backend::AudioClip::new(&path);
        assert!(clip.duration_secs().unwrap() > 0.0);
        clip.discard();
    }

    #[test]
    fn empty_voice_arrays_are_rejected() {
        let empty = Array3::<f32>::zeros((0, 1, STYLE_DIM));
        assert!(voice_styles("af_empty", empty).unwrap_err().contains("af_empty"));

        let wrong_dim = Array3::<f32>::zeros((510, 1, 128));
        assert!(voice_styles("af_narrow", wrong_dim).is_err());

        let styles = voice_styles("af_heart", Array3::<f32>::zeros((510, 1, STYLE_DIM))).unwrap();
        assert_eq!(styles.dim(), (510, STYLE_DIM));
    }

    #[test]
    fn render_rejects_empty_audio() {
        assert!(render_to_wav(&mut Tone, "", &params()).is_err());
    }
}
