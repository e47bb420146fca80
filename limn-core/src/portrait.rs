//! Orchestration of the two services: describe a book character with the chat
//! model, extract the quoted description, render a batch of portraits.

use std::io::Cursor;
use std::path::Path;
use std::time::Instant;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::{ChatModelLike, Error, GenerationRequest, ImageModelLike, Result};

static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]*)""#).expect("static pattern"));

/// Asks for a short, quoted, comma-separated physical description.
fn character_question(book: &str, character: &str) -> String {
    format!(
        "Describe what {character} ({book} character) looks like. The response is a \
         comma-separated list of SHORT, concrete phrases describing the character's gender, \
         age, physical appearance and how they dress. The response is 20-30 words. Put quotes \
         around the response. Example of response format: \"tall, imposing man with a rugged \
         and weathered appearance, square head, dark unkempt hair, strong hands, broad \
         shoulders, no-nonsense demeanor, plain and practical clothing\""
    )
}

/// First double-quoted substring of `text`, quotes stripped.
fn extract_quoted(text: &str) -> Result<String> {
    QUOTED
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(Error::Extraction)
}

/// Portrait prompt for an extracted character description.
pub fn portrait_prompt(description: &str) -> String {
    format!("Portrait of {description}, by Greg Rutkowski, digital painting")
}

pub fn describe_character(
    chat: &dyn ChatModelLike,
    book: &str,
    character: &str,
) -> Result<String> {
    let questions = vec![character_question(book, character)];
    let answers = chat.run(&questions)?;
    let answer = answers.first().ok_or(Error::Extraction)?;
    extract_quoted(answer)
}

/// Base64-encoded PNGs, `samples * batch_size` in total.
///
/// Each sample is one blocking call into the diffusion service; samples run
/// strictly sequentially. When `output_dir` is set every image is also written
/// there as `output_<image>_<sample>.png`.
pub fn generate_images(
    model: &dyn ImageModelLike,
    request: &GenerationRequest,
    output_dir: Option<&Path>,
) -> Result<Vec<String>> {
    request.validate()?;
    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Configuration(format!("create {}: {e}", dir.display())))?;
    }

    let mut encoded = Vec::with_capacity(request.samples * request.batch_size);
    for sample in 0..request.samples {
        let started = Instant::now();
        let images = model.run(&request.prompt, request.steps, request.batch_size)?;
        let elapsed = started.elapsed().as_secs_f64();
        info!(
            sample,
            images = images.len(),
            secs = elapsed,
            secs_per_image = elapsed / images.len().max(1) as f64,
            "sample finished"
        );

        for (index, image) in images.iter().enumerate() {
            let png = png_bytes(image)?;
            if let Some(dir) = output_dir {
                let path = dir.join(format!("output_{index}_{sample}.png"));
                std::fs::write(&path, &png)
                    .map_err(|e| Error::Configuration(format!("write {}: {e}", path.display())))?;
            }
            encoded.push(BASE64_STANDARD.encode(&png));
        }
    }
    Ok(encoded)
}

/// Describe the character, then render the default portrait batch.
pub fn run_end_to_end(
    chat: &dyn ChatModelLike,
    model: &dyn ImageModelLike,
    book: &str,
    character: &str,
    output_dir: Option<&Path>,
) -> Result<Vec<String>> {
    let description = describe_character(chat, book, character)?;
    info!(%description, "extracted character description");
    let request = GenerationRequest {
        prompt: portrait_prompt(&description),
        samples: 1,
        steps: 20,
        batch_size: 5,
    };
    generate_images(model, &request, output_dir)
}

fn png_bytes(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use base64::prelude::BASE64_STANDARD;
    use base64::Engine;
    use image::DynamicImage;

    use super::{describe_character, extract_quoted, generate_images, run_end_to_end};
    use crate::{ChatModelLike, Error, GenerationRequest, ImageModelLike, Result};

    const PNG_MAGIC: &[u8] = b"\x89PNG";

    struct StubChat {
        answer: String,
        questions: Mutex<Vec<String>>,
    }

    impl StubChat {
        fn answering(answer: &str) -> Self {
            Self {
                answer: answer.to_string(),
                questions: Mutex::new(Vec::new()),
            }
        }
    }

    impl ChatModelLike for StubChat {
        fn run(&self, questions: &[String]) -> Result<Vec<String>> {
            self.questions.lock().unwrap().extend_from_slice(questions);
            Ok(questions.iter().map(|_| self.answer.clone()).collect())
        }
    }

    #[derive(Default)]
    struct StubDiffusion {
        prompts: Mutex<Vec<String>>,
    }

    impl ImageModelLike for StubDiffusion {
        fn run(&self, prompt: &str, _steps: usize, batch_size: usize) -> Result<Vec<DynamicImage>> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok((0..batch_size)
                .map(|_| DynamicImage::ImageRgb8(image::RgbImage::new(1, 1)))
                .collect())
        }
    }

    #[test]
    fn extracts_first_quoted_substring() {
        let text = r#"Here you go: "tall man, dark hair" or maybe "short""#;
        assert_eq!(extract_quoted(text).unwrap(), "tall man, dark hair");
    }

    #[test]
    fn describe_character_strips_quotes() {
        let chat = StubChat::answering(r#""tall man, dark hair""#);
        let description = describe_character(&chat, "Some Book", "Someone").unwrap();
        assert_eq!(description, "tall man, dark hair");
    }

    #[test]
    fn describe_character_asks_one_question_about_the_character() {
        let chat = StubChat::answering(r#""an answer""#);
        describe_character(&chat, "Remains of the Day", "Stevens").unwrap();
        let questions = chat.questions.lock().unwrap();
        assert_eq!(questions.len(), 1);
        assert!(questions[0].starts_with("Describe what Stevens (Remains of the Day character)"));
    }

    #[test]
    fn unquoted_answer_is_an_extraction_error() {
        let chat = StubChat::answering("tall man, dark hair");
        assert!(matches!(
            describe_character(&chat, "Some Book", "Someone"),
            Err(Error::Extraction)
        ));
    }

    #[test]
    fn returns_samples_times_batch_size_pngs() {
        let model = StubDiffusion::default();
        let request = GenerationRequest {
            prompt: "a cat".to_string(),
            samples: 2,
            steps: 10,
            batch_size: 3,
        };
        let encoded = generate_images(&model, &request, None).unwrap();
        assert_eq!(encoded.len(), 6);
        for entry in &encoded {
            let bytes = BASE64_STANDARD.decode(entry).unwrap();
            assert_eq!(&bytes[..4], PNG_MAGIC);
        }
    }

    #[test]
    fn invalid_request_is_rejected_before_inference() {
        let model = StubDiffusion::default();
        let request = GenerationRequest {
            prompt: "a cat".to_string(),
            samples: 0,
            steps: 10,
            batch_size: 3,
        };
        assert!(matches!(
            generate_images(&model, &request, None),
            Err(Error::InvalidRequest(_))
        ));
        assert!(model.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn end_to_end_builds_the_portrait_prompt() {
        let chat = StubChat::answering(r#""weathered butler in a crisp black suit""#);
        let model = StubDiffusion::default();

        let encoded = run_end_to_end(&chat, &model, "X", "Y", None).unwrap();
        assert_eq!(encoded.len(), 5);

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(
            prompts[0],
            "Portrait of weathered butler in a crisp black suit, by Greg Rutkowski, digital painting"
        );
    }
}
