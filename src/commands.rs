/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ordinary message for the assistant.
    Say(String),
    /// Message answered without pondering or reflection.
    Plain(String),
    Reset,
    Transcript,
    Report,
    Help,
    Quit,
    Empty,
}

pub fn parse(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }

    if let Some(rest) = line.strip_prefix('/') {
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        return match name.to_ascii_lowercase().as_str() {
            "reset" => Command::Reset,
            "plain" if !arg.is_empty() => Command::Plain(arg.to_string()),
            "plain" => Command::Help,
            "transcript" => Command::Transcript,
            "report" => Command::Report,
            "quit" | "exit" => Command::Quit,
            _ => Command::Help,
        };
    }

    if is_spoken_reset(line) {
        return Command::Reset;
    }
    Command::Say(line.to_string())
}

/// "Command: reset memory!" and similar spoken forms.
fn is_spoken_reset(text: &str) -> bool {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect::<String>()
        .to_lowercase();
    let normalized = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    normalized.ends_with("command reset memory")
}

pub const HELP: &str = "\
/reset             forget the conversation (also: \"command reset memory\")
/plain <message>   answer without pondering or reflection
/transcript        show the speaking transcript as the model sees it
/report            show statistics for the last turn
/quit              leave";
