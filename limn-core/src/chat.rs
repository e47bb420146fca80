use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{self, Llama, LlamaConfig};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::cache::{self, WeightsCache};
use crate::device::{dtype_for, select_best_device};
use crate::{ChatModelLike, DeviceMap, Error, Loader, Result};

const EOS_TOKEN: &str = "</s>";

// Fixed sampling parameters for every question.
const TEMPERATURE: f64 = 0.3;
const TOP_P: f64 = 1.0;
const MAX_NEW_TOKENS: usize = 200;

/// Wraps a question in the assistant prompt applied to every generation.
fn wrap_question(question: &str) -> String {
    format!("SYSTEM: You are a helpful assistant. USER: {question} ASSISTANT: ")
}

/// One prompt per question, in input order.
fn wrap_questions(questions: &[String]) -> Vec<String> {
    questions.iter().map(|q| wrap_question(q)).collect()
}

/// Runs `complete` for every question and collects one answer per question,
/// in input order.
fn answer_all(
    questions: &[String],
    complete: impl Fn(&str) -> Result<String>,
) -> Result<Vec<String>> {
    let prompts = wrap_questions(questions);
    let mut answers = Vec::with_capacity(prompts.len());
    for prompt in &prompts {
        answers.push(complete(prompt.as_str())?);
    }
    Ok(answers)
}

pub struct ChatModel {
    model: Llama,
    tokenizer: Tokenizer,
    config: llama::Config,
    device: Device,
    dtype: DType,
}

impl ChatModel {
    fn complete(&self, prompt: &str) -> Result<String> {
        // Fresh kv cache per prompt.
        let mut cache = llama::Cache::new(true, self.dtype, &self.config, &self.device)?;
        let mut tokens = self.tokenizer.encode(prompt, true)?.get_ids().to_vec();
        let eos_token_id = self.tokenizer.token_to_id(EOS_TOKEN);

        let mut logits_processor =
            LogitsProcessor::new(clock_seed(), Some(TEMPERATURE), Some(TOP_P));
        let mut generated: Vec<u32> = Vec::new();
        let mut index_pos = 0;

        let started = std::time::Instant::now();
        for index in 0..MAX_NEW_TOKENS {
            let (context_size, context_index) = if index > 0 {
                (1, index_pos)
            } else {
                (tokens.len(), 0)
            };
            let ctxt = &tokens[tokens.len().saturating_sub(context_size)..];
            let input = Tensor::new(ctxt, &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .forward(&input, context_index, &mut cache)?
                .squeeze(0)?;
            index_pos += ctxt.len();

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            if Some(next_token) == eos_token_id {
                break;
            }
            generated.push(next_token);
        }
        debug!(
            tokens = generated.len(),
            elapsed = ?started.elapsed(),
            "completion finished"
        );

        Ok(self.tokenizer.decode(&generated, true)?)
    }
}

impl ChatModelLike for ChatModel {
    fn run(&self, questions: &[String]) -> Result<Vec<String>> {
        answer_all(questions, |prompt| self.complete(prompt))
    }
}

pub struct ChatLoader;

impl Loader for ChatLoader {
    type Model = ChatModel;

    fn load(weights: &WeightsCache, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map)?;
        let dtype = dtype_for(&device);

        let tokenizer_file = weights.get(cache::CHAT_MODEL_ID, "tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| Error::Configuration(format!("malformed chat tokenizer: {e}")))?;

        let config_file = weights.get(cache::CHAT_MODEL_ID, "config.json")?;
        let config_bytes = std::fs::read(&config_file)
            .map_err(|e| Error::Configuration(format!("read {}: {e}", config_file.display())))?;
        let config: LlamaConfig = serde_json::from_slice(&config_bytes)
            .map_err(|e| Error::Configuration(format!("malformed chat config: {e}")))?;
        let config = config.into_config(cfg!(feature = "flash-attn"));

        let shards = weights.chat_shards()?;
        info!(
            model = cache::CHAT_MODEL_ID,
            shards = shards.len(),
            ?device,
            "loading chat model"
        );
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&shards, dtype, &device)? };
        let model = Llama::load(vb, &config)?;

        Ok(ChatModel {
            model,
            tokenizer,
            config,
            device,
            dtype,
        })
    }
}

/// Nanosecond resolution so back-to-back completions sample differently.
fn clock_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

#[cfg(test)]
mod tests {
    use super::{answer_all, wrap_question, wrap_questions};
    use crate::Error;

    #[test]
    fn question_gets_assistant_wrapper() {
        assert_eq!(
            wrap_question("What color is the sky?"),
            "SYSTEM: You are a helpful assistant. USER: What color is the sky? ASSISTANT: "
        );
    }

    #[test]
    fn every_question_is_wrapped_in_input_order() {
        let questions = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let prompts = wrap_questions(&questions);
        assert_eq!(prompts.len(), 3);
        for (prompt, question) in prompts.iter().zip(&questions) {
            assert!(prompt.contains(&format!("USER: {question} ASSISTANT: ")));
        }
    }

    // Three questions in, three answers out, in input order. The deployment
    // this replaces kept only the last answer when given several questions.
    #[test]
    fn returns_one_answer_per_question_in_input_order() {
        let questions = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let answers = answer_all(&questions, |prompt| {
            let question = prompt
                .trim_start_matches("SYSTEM: You are a helpful assistant. USER: ")
                .trim_end_matches(" ASSISTANT: ");
            Ok(format!("answer to {question}"))
        })
        .unwrap();
        assert_eq!(
            answers,
            vec![
                "answer to one".to_string(),
                "answer to two".to_string(),
                "answer to three".to_string(),
            ]
        );
    }

    #[test]
    fn completion_failure_stops_the_batch() {
        let questions = vec!["one".to_string(), "two".to_string()];
        let result = answer_all(&questions, |_| Err(Error::Inference("oom".into())));
        assert!(matches!(result, Err(Error::Inference(_))));
    }
}
