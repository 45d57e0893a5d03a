//! Prompt builders for the vision model. Every prompt is a pure function
//! of its arguments and embeds the exact reply format the parsers in
//! [`super::responses`] understand.

/// System prompt sent with every model call, parameterised by the remote
/// desktop resolution.
pub fn system_prompt(width: u32, height: u32) -> String {
    format!(
        "You are the eyes of a desktop automation system. You are shown \
         screenshots of a Windows application running on a remote desktop \
         with a resolution of {width}x{height} pixels. The coordinate origin \
         is the top-left corner; x grows to the right and y grows downward.\n\
         \n\
         Rules:\n\
         - Answer ONLY in the exact format the instruction asks for.\n\
         - Never add explanations, markdown or extra lines unless asked.\n\
         - Coordinates must be integer pixel positions within {width}x{height}.\n\
         - When you cannot find what is asked for, say so in the requested \
         format instead of guessing."
    )
}

/// Asks whether the screen currently matches a description.
/// Reply format: `MATCH` / `NO_MATCH` / `UNCERTAIN`.
pub fn expect_prompt(description: &str) -> String {
    format!(
        "Does the current screen match this description: \"{description}\"?\n\
         \n\
         Respond with exactly one word on the first line:\n\
         MATCH - the screen clearly matches the description\n\
         NO_MATCH - the screen clearly does not match\n\
         UNCERTAIN - you cannot tell"
    )
}

/// Asks for the click point of a UI element.
/// Reply format: `x,y` or `NOT_FOUND: reason`.
pub fn locate_prompt(target: &str) -> String {
    format!(
        "Locate the UI element best described as \"{target}\" on the \
         screenshot and give the pixel coordinates of its centre.\n\
         \n\
         Respond on a single line with exactly:\n\
         x,y\n\
         using integer pixel values, for example: 400,300\n\
         If the element is not visible, respond instead with:\n\
         NOT_FOUND: <short reason>"
    )
}

/// Asks for the option click point inside an opened dropdown.
/// Reply format: `x,y` or `NOT_FOUND: reason`.
pub fn locate_option_prompt(option: &str, target: &str) -> String {
    format!(
        "The dropdown \"{target}\" has just been opened. Locate the list \
         option whose text is \"{option}\" and give the pixel coordinates \
         of its centre.\n\
         \n\
         Respond on a single line with exactly:\n\
         x,y\n\
         If the option is not visible in the open list, respond instead with:\n\
         NOT_FOUND: <short reason>"
    )
}

/// Asks for the text content of an element.
/// Reply format: the value, `EMPTY`, or `NOT_FOUND`.
pub fn extract_prompt(source: &str) -> String {
    format!(
        "Read the value shown in the UI element described as \"{source}\".\n\
         \n\
         Respond with the value text and nothing else.\n\
         If the element exists but is blank, respond with exactly: EMPTY\n\
         If the element is not visible, respond with exactly: NOT_FOUND"
    )
}

/// Asks a yes/no question about the screen.
/// Reply format: `YES` or `NO`.
pub fn question_prompt(condition: &str) -> String {
    format!(
        "Does the current screen show: \"{condition}\"?\n\
         \n\
         Respond with exactly one word on the first line: YES or NO"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_embeds_resolution() {
        let prompt = system_prompt(1920, 1080);
        assert!(prompt.contains("1920x1080"));
    }

    #[test]
    fn prompts_embed_arguments_verbatim() {
        assert!(expect_prompt("the Save dialog").contains("\"the Save dialog\""));
        assert!(locate_prompt("Save").contains("\"Save\""));
        assert!(locate_option_prompt("Germany", "Country").contains("\"Germany\""));
        assert!(extract_prompt("Total").contains("\"Total\""));
        assert!(question_prompt("an error banner").contains("\"an error banner\""));
    }

    #[test]
    fn prompts_are_deterministic() {
        assert_eq!(locate_prompt("Save"), locate_prompt("Save"));
        assert_eq!(system_prompt(800, 600), system_prompt(800, 600));
    }

    #[test]
    fn prompts_name_their_reply_format() {
        assert!(expect_prompt("x").contains("MATCH"));
        assert!(expect_prompt("x").contains("NO_MATCH"));
        assert!(locate_prompt("x").contains("NOT_FOUND"));
        assert!(extract_prompt("x").contains("EMPTY"));
        assert!(question_prompt("x").contains("YES"));
    }
}
