use crate::core::{ChatMessage, PromptFamily};

pub fn stop_markers(family: PromptFamily) -> &'static [&'static str] {
    match family {
        PromptFamily::Llama3 => &["<|eot_id|>", "<|end_of_text|>"],
        PromptFamily::ChatMl => &["<|im_end|>", "<|endoftext|>"],
    }
}

/// Renders a transcript into a prompt that ends with an open assistant turn.
///
/// `system_prompt` is only used when the transcript has no leading system message.
pub fn render_prompt(family: PromptFamily, messages: &[ChatMessage], system_prompt: Option<&str>) -> String {
    let mut prompt = String::new();

    let injected = system_prompt
        .filter(|_| !messages.first().is_some_and(ChatMessage::is_system))
        .map(ChatMessage::system);

    for message in injected.iter().chain(messages) {
        push_turn(&mut prompt, family, message.role.as_str(), &message.content);
    }

    match family {
        PromptFamily::Llama3 => prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n"),
        PromptFamily::ChatMl => prompt.push_str("<|im_start|>assistant\n"),
    }
    prompt
}

fn push_turn(prompt: &mut String, family: PromptFamily, role: &str, content: &str) {
    match family {
        PromptFamily::Llama3 => {
            prompt.push_str("<|start_header_id|>");
            prompt.push_str(role);
            prompt.push_str("<|end_header_id|>\n\n");
            prompt.push_str(content.trim());
            prompt.push_str("<|eot_id|>");
        }
        PromptFamily::ChatMl => {
            prompt.push_str("<|im_start|>");
            prompt.push_str(role);
            prompt.push('\n');
            prompt.push_str(content.trim());
            prompt.push_str("<|im_end|>\n");
        }
    }
}

/// Cuts `text` at the first stop marker, if any.
pub fn strip_stop_markers(family: PromptFamily, text: &str) -> (String, bool) {
    let cut = stop_markers(family)
        .iter()
        .filter_map(|marker| text.find(marker))
        .min();
    match cut {
        Some(idx) => (text[..idx].to_string(), true),
        None => (text.to_string(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chatml_render_injects_system_prompt() {
        let prompt = render_prompt(
            PromptFamily::ChatMl,
            &[ChatMessage::user("Hello")],
            Some("Be brief."),
        );
        assert_eq!(
            prompt,
            "<|im_start|>system\nBe brief.<|im_end|>\n<|im_start|>user\nHello<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_existing_system_message_wins() {
        let prompt = render_prompt(
            PromptFamily::Llama3,
            &[ChatMessage::system("Own prompt"), ChatMessage::user("Hi")],
            Some("Injected"),
        );
        assert!(prompt.contains("Own prompt"));
        assert!(!prompt.contains("Injected"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_strip_stop_markers() {
        let (text, stopped) = strip_stop_markers(PromptFamily::ChatMl, "Sure.<|im_end|>\n<|im_start|>");
        assert_eq!(text, "Sure.");
        assert!(stopped);

        let (text, stopped) = strip_stop_markers(PromptFamily::Llama3, "still going");
        assert_eq!(text, "still going");
        assert!(!stopped);
    }
}
