//! Slash-command grammar for the interactive loop.
//!
//! Plain text is a generation prompt. Arguments are split shell-style so
//! quoted paths survive; unbalanced quotes fall back to whitespace splitting.

use crate::records::InpaintMode;

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/draw [--style S] [--ratio R] <prompt>",
    "/ref [--style S] [--ratio R] <prompt>",
    "/edit <id> <n> <prompt>",
    "/expand <id> <n> [ratio]",
    "/inpaint [--brush] [--invert] <prompt>",
    "/cutout",
    "/upload <path>",
    "/regen <id>",
    "/pick <id> <n>",
    "/show <id>",
    "/latest",
    "/compose <id> [path]",
    "/cancel",
    "/reset",
    "/quit",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Noop,
    Help,
    Quit,
    Generate {
        prompt: String,
        style: Option<String>,
        ratio: Option<String>,
    },
    Reference {
        prompt: String,
        style: Option<String>,
        ratio: Option<String>,
    },
    Edit {
        record_id: String,
        index: usize,
        prompt: String,
    },
    Outpaint {
        record_id: String,
        index: usize,
        ratio: Option<String>,
    },
    Inpaint {
        prompt: String,
        mode: InpaintMode,
        invert: bool,
    },
    Cutout,
    Upload {
        path: String,
    },
    Regenerate {
        record_id: String,
    },
    Pick {
        record_id: String,
        index: usize,
    },
    Show {
        record_id: String,
    },
    Latest,
    Compose {
        record_id: String,
        path: Option<String>,
    },
    Cancel,
    Reset,
    /// A known command with arguments it cannot use.
    Usage(&'static str),
    Unknown(String),
}

fn split_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    }
}

/// Pulls `--style` and `--ratio` out of `args`, returning what is left as the
/// prompt.
fn take_prompt_options(args: Vec<String>) -> (String, Option<String>, Option<String>) {
    let mut style = None;
    let mut ratio = None;
    let mut words = Vec::new();
    let mut iter = args.into_iter();
    while let Some(word) = iter.next() {
        match word.as_str() {
            "--style" => style = iter.next(),
            "--ratio" => ratio = iter.next(),
            _ => {
                if let Some(value) = word.strip_prefix("--style=") {
                    style = Some(value.to_string());
                } else if let Some(value) = word.strip_prefix("--ratio=") {
                    ratio = Some(value.to_string());
                } else {
                    words.push(word);
                }
            }
        }
    }
    (words.join(" "), style, ratio)
}

fn record_and_index(args: &[String]) -> Option<(String, usize)> {
    let record_id = args.first()?.clone();
    let index = args.get(1)?.parse().ok()?;
    Some((record_id, index))
}

pub fn parse_command(text: &str) -> ChatCommand {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ChatCommand::Noop;
    }
    let Some(tail) = trimmed.strip_prefix('/') else {
        return ChatCommand::Generate {
            prompt: trimmed.to_string(),
            style: None,
            ratio: None,
        };
    };

    let command_len = tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    let command = tail[..command_len].to_ascii_lowercase();
    let args = split_args(&tail[command_len..]);

    match command.as_str() {
        "help" => ChatCommand::Help,
        "quit" | "exit" => ChatCommand::Quit,
        "draw" => {
            let (prompt, style, ratio) = take_prompt_options(args);
            if prompt.is_empty() {
                return ChatCommand::Usage(CHAT_HELP_COMMANDS[0]);
            }
            ChatCommand::Generate {
                prompt,
                style,
                ratio,
            }
        }
        "ref" => {
            let (prompt, style, ratio) = take_prompt_options(args);
            if prompt.is_empty() {
                return ChatCommand::Usage(CHAT_HELP_COMMANDS[1]);
            }
            ChatCommand::Reference {
                prompt,
                style,
                ratio,
            }
        }
        "edit" => match record_and_index(&args) {
            Some((record_id, index)) if args.len() > 2 => ChatCommand::Edit {
                record_id,
                index,
                prompt: args[2..].join(" "),
            },
            _ => ChatCommand::Usage(CHAT_HELP_COMMANDS[2]),
        },
        "expand" => match record_and_index(&args) {
            Some((record_id, index)) => ChatCommand::Outpaint {
                record_id,
                index,
                ratio: args.get(2).cloned(),
            },
            None => ChatCommand::Usage(CHAT_HELP_COMMANDS[3]),
        },
        "inpaint" => {
            let mut mode = InpaintMode::Circle;
            let mut invert = false;
            let mut words = Vec::new();
            for word in args {
                match word.as_str() {
                    "--brush" => mode = InpaintMode::Brush,
                    "--invert" => invert = true,
                    _ => words.push(word),
                }
            }
            if words.is_empty() {
                return ChatCommand::Usage(CHAT_HELP_COMMANDS[4]);
            }
            ChatCommand::Inpaint {
                prompt: words.join(" "),
                mode,
                invert,
            }
        }
        "cutout" => ChatCommand::Cutout,
        "upload" => match args.as_slice() {
            [] => ChatCommand::Usage(CHAT_HELP_COMMANDS[6]),
            parts => ChatCommand::Upload {
                path: parts.join(" "),
            },
        },
        "regen" => match args.first() {
            Some(record_id) => ChatCommand::Regenerate {
                record_id: record_id.clone(),
            },
            None => ChatCommand::Usage(CHAT_HELP_COMMANDS[7]),
        },
        "pick" => match record_and_index(&args) {
            Some((record_id, index)) => ChatCommand::Pick { record_id, index },
            None => ChatCommand::Usage(CHAT_HELP_COMMANDS[8]),
        },
        "show" => match args.first() {
            Some(record_id) => ChatCommand::Show {
                record_id: record_id.clone(),
            },
            None => ChatCommand::Usage(CHAT_HELP_COMMANDS[9]),
        },
        "latest" => ChatCommand::Latest,
        "compose" => match args.first() {
            Some(record_id) => ChatCommand::Compose {
                record_id: record_id.clone(),
                path: args.get(1).cloned(),
            },
            None => ChatCommand::Usage(CHAT_HELP_COMMANDS[11]),
        },
        "cancel" => ChatCommand::Cancel,
        "reset" => ChatCommand::Reset,
        _ => ChatCommand::Unknown(command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_generates() {
        assert_eq!(
            parse_command("  a cat on a sofa "),
            ChatCommand::Generate {
                prompt: "a cat on a sofa".to_string(),
                style: None,
                ratio: None,
            }
        );
        assert_eq!(parse_command("   "), ChatCommand::Noop);
    }

    #[test]
    fn draw_takes_style_and_ratio_flags() {
        assert_eq!(
            parse_command("/draw --style \"oil painting\" a harbor --ratio=16:9"),
            ChatCommand::Generate {
                prompt: "a harbor".to_string(),
                style: Some("oil painting".to_string()),
                ratio: Some("16:9".to_string()),
            }
        );
        assert_eq!(parse_command("/draw --style anime"), ChatCommand::Usage(CHAT_HELP_COMMANDS[0]));
    }

    #[test]
    fn record_commands_need_an_index() {
        assert_eq!(
            parse_command("/edit 1700000000 2 add a red hat"),
            ChatCommand::Edit {
                record_id: "1700000000".to_string(),
                index: 2,
                prompt: "add a red hat".to_string(),
            }
        );
        assert_eq!(
            parse_command("/edit 1700000000 two hat"),
            ChatCommand::Usage(CHAT_HELP_COMMANDS[2])
        );
        assert_eq!(
            parse_command("/expand 17 1"),
            ChatCommand::Outpaint {
                record_id: "17".to_string(),
                index: 1,
                ratio: None,
            }
        );
        assert_eq!(
            parse_command("/PICK 17 4"),
            ChatCommand::Pick {
                record_id: "17".to_string(),
                index: 4,
            }
        );
    }

    #[test]
    fn inpaint_flags_and_quoted_upload_paths() {
        assert_eq!(
            parse_command("/inpaint --brush --invert make it night"),
            ChatCommand::Inpaint {
                prompt: "make it night".to_string(),
                mode: InpaintMode::Brush,
                invert: true,
            }
        );
        assert_eq!(
            parse_command("/upload \"/tmp/my photo.png\""),
            ChatCommand::Upload {
                path: "/tmp/my photo.png".to_string(),
            }
        );
        assert_eq!(parse_command("/frobnicate x"), ChatCommand::Unknown("frobnicate".to_string()));
    }
}
