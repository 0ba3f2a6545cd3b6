//! Line-oriented console: parses what the user types and renders log lines.

use shared::{
    Author, DiceFormula, LogContent, LogEntry, RollVisibility, SketchElement, SketchState,
    Visibility,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Roll {
        formula: DiceFormula,
        label: Option<String>,
        visibility: RollVisibility,
    },
    Say(String),
    Note {
        note_id: String,
        title: String,
        text: String,
    },
    Sketch(SketchEdit),
    Play {
        track: String,
        looped: bool,
    },
    Stop(Option<String>),
    Viewer {
        user_id: String,
        allowed: bool,
    },
    End,
    Who,
    Help,
    Quit,
}

/// An edit to the master's sketch, applied to the current one before sending
#[derive(Debug, Clone, PartialEq)]
pub enum SketchEdit {
    Clear,
    Show,
    Hide,
    Token {
        id: String,
        label: String,
        x: f32,
        y: f32,
    },
    Background(String),
}

impl SketchEdit {
    pub fn apply(&self, sketch: &mut SketchState) {
        match self {
            SketchEdit::Clear => sketch.elements.clear(),
            SketchEdit::Show => sketch.displayed = true,
            SketchEdit::Hide => sketch.displayed = false,
            SketchEdit::Token { id, label, x, y } => {
                let existing = sketch.elements.iter_mut().find_map(|element| match element {
                    SketchElement::Token {
                        id: token_id,
                        label,
                        x,
                        y,
                        ..
                    } if token_id == id => Some((label, x, y)),
                    _ => None,
                });
                match existing {
                    Some((old_label, old_x, old_y)) => {
                        *old_label = label.clone();
                        *old_x = *x;
                        *old_y = *y;
                    }
                    None => sketch.elements.push(SketchElement::Token {
                        id: id.clone(),
                        label: label.clone(),
                        x: *x,
                        y: *y,
                        asset: None,
                    }),
                }
            }
            SketchEdit::Background(asset) => {
                sketch
                    .elements
                    .retain(|element| !matches!(element, SketchElement::Background { .. }));
                sketch.elements.insert(
                    0,
                    SketchElement::Background {
                        asset: asset.clone(),
                    },
                );
            }
        }
    }
}

pub const HELP: &str = "\
commands:
  /roll FORMULA [label]        public roll, e.g. /roll 2d6+1 damage
  /secret FORMULA [label]      roll only you and the master see
  /say TEXT                    chat (plain text works too)
  /note ID TITLE|TEXT          create or replace one of your notes
  /sketch clear|show|hide      master only
  /sketch token ID LABEL X Y   place or move a token
  /sketch bg ASSET             set the background
  /play TRACK [loop]           start a sound for everyone
  /stop [TRACK]                stop one or all sounds
  /viewer USER on|off          let a player see every character sheet
  /end                         end the session
  /who                         list participants
  /help                        this text
  /quit                        leave";

/// Parses one input line
pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    if line.is_empty() {
        return Err("nothing to send".to_string());
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(ConsoleCommand::Say(line.to_string()));
    };

    let (command, args) = match rest.split_once(char::is_whitespace) {
        Some((command, args)) => (command, args.trim()),
        None => (rest, ""),
    };

    match command {
        "roll" | "r" => parse_roll(args, RollVisibility::Public),
        "secret" => parse_roll(args, RollVisibility::Private),
        "say" if !args.is_empty() => Ok(ConsoleCommand::Say(args.to_string())),
        "note" => {
            let (note_id, body) = args
                .split_once(char::is_whitespace)
                .ok_or("usage: /note ID TITLE|TEXT")?;
            let (title, text) = body.split_once('|').unwrap_or((body, ""));
            Ok(ConsoleCommand::Note {
                note_id: note_id.to_string(),
                title: title.trim().to_string(),
                text: text.trim().to_string(),
            })
        }
        "sketch" => parse_sketch(args).map(ConsoleCommand::Sketch),
        "play" => {
            let mut words = args.split_whitespace();
            let track = words.next().ok_or("usage: /play TRACK [loop]")?;
            Ok(ConsoleCommand::Play {
                track: track.to_string(),
                looped: words.next() == Some("loop"),
            })
        }
        "stop" => Ok(ConsoleCommand::Stop(
            args.split_whitespace().next().map(str::to_string),
        )),
        "viewer" => {
            let mut words = args.split_whitespace();
            match (words.next(), words.next()) {
                (Some(user_id), Some("on")) => Ok(ConsoleCommand::Viewer {
                    user_id: user_id.to_string(),
                    allowed: true,
                }),
                (Some(user_id), Some("off")) => Ok(ConsoleCommand::Viewer {
                    user_id: user_id.to_string(),
                    allowed: false,
                }),
                _ => Err("usage: /viewer USER on|off".to_string()),
            }
        }
        "end" => Ok(ConsoleCommand::End),
        "who" => Ok(ConsoleCommand::Who),
        "help" | "?" => Ok(ConsoleCommand::Help),
        "quit" | "q" => Ok(ConsoleCommand::Quit),
        _ => Err(format!("unknown command '/{}', try /help", command)),
    }
}

fn parse_roll(args: &str, visibility: RollVisibility) -> Result<ConsoleCommand, String> {
    let (formula, label) = match args.split_once(char::is_whitespace) {
        Some((formula, label)) => (formula, Some(label.trim().to_string())),
        None => (args, None),
    };
    let formula = formula.parse::<DiceFormula>().map_err(|e| e.to_string())?;
    Ok(ConsoleCommand::Roll {
        formula,
        label: label.filter(|l| !l.is_empty()),
        visibility,
    })
}

fn parse_sketch(args: &str) -> Result<SketchEdit, String> {
    let words: Vec<&str> = args.split_whitespace().collect();
    match words.as_slice() {
        ["clear"] => Ok(SketchEdit::Clear),
        ["show"] => Ok(SketchEdit::Show),
        ["hide"] => Ok(SketchEdit::Hide),
        ["bg", asset] => Ok(SketchEdit::Background(asset.to_string())),
        ["token", id, label, x, y] => {
            let x = x.parse::<f32>().map_err(|_| format!("bad x '{}'", x))?;
            let y = y.parse::<f32>().map_err(|_| format!("bad y '{}'", y))?;
            Ok(SketchEdit::Token {
                id: id.to_string(),
                label: label.to_string(),
                x,
                y,
            })
        }
        _ => Err("usage: /sketch clear|show|hide|token ID LABEL X Y|bg ASSET".to_string()),
    }
}

/// Renders a log entry as one console line
pub fn format_entry(entry: &LogEntry) -> String {
    let author = match &entry.author {
        Author::Participant(user_id) => user_id.as_str(),
        Author::Server => "*",
    };
    let secret = if matches!(entry.visibility, Visibility::MasterAnd(_)) {
        " (secret)"
    } else {
        ""
    };

    match &entry.content {
        LogContent::Chat(text) => format!("#{} <{}> {}", entry.seq, author, text),
        LogContent::Dice(roll) => {
            let label = roll
                .label
                .as_ref()
                .map(|l| format!(" for {}", l))
                .unwrap_or_default();
            format!(
                "#{} {} rolled {}{}: {:?} = {}{}",
                entry.seq, author, roll.formula, label, roll.rolls, roll.total, secret
            )
        }
        LogContent::Joined { display_name, role } => {
            format!("#{} {} joined as {:?}", entry.seq, display_name, role)
        }
        LogContent::Left { display_name } => format!("#{} {} left", entry.seq, display_name),
        LogContent::SessionEnded { reason } => {
            format!("#{} session ended: {}", entry.seq, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{DiceRoll, Role};

    #[test]
    fn test_plain_text_is_chat() {
        assert_eq!(
            parse_command("  hello table "),
            Ok(ConsoleCommand::Say("hello table".into()))
        );
        assert_eq!(
            parse_command("/say /not a command"),
            Ok(ConsoleCommand::Say("/not a command".into()))
        );
        assert!(parse_command("   ").is_err());
    }

    #[test]
    fn test_roll_commands() {
        assert_eq!(
            parse_command("/roll 1d20+3 perception check"),
            Ok(ConsoleCommand::Roll {
                formula: DiceFormula::new(1, 20, 3),
                label: Some("perception check".into()),
                visibility: RollVisibility::Public,
            })
        );
        assert_eq!(
            parse_command("/secret 2d6"),
            Ok(ConsoleCommand::Roll {
                formula: DiceFormula::new(2, 6, 0),
                label: None,
                visibility: RollVisibility::Private,
            })
        );
        assert!(parse_command("/roll lots").is_err());
        assert!(parse_command("/roll").is_err());
    }

    #[test]
    fn test_other_commands() {
        assert_eq!(
            parse_command("/note n1 Clues|the butler lied"),
            Ok(ConsoleCommand::Note {
                note_id: "n1".into(),
                title: "Clues".into(),
                text: "the butler lied".into(),
            })
        );
        assert_eq!(
            parse_command("/play rain.ogg loop"),
            Ok(ConsoleCommand::Play {
                track: "rain.ogg".into(),
                looped: true
            })
        );
        assert_eq!(parse_command("/stop"), Ok(ConsoleCommand::Stop(None)));
        assert_eq!(
            parse_command("/viewer bob on"),
            Ok(ConsoleCommand::Viewer {
                user_id: "bob".into(),
                allowed: true
            })
        );
        assert!(parse_command("/viewer bob maybe").is_err());
        assert!(parse_command("/dance").is_err());
    }

    #[test]
    fn test_sketch_edits() {
        let mut sketch = SketchState::default();
        for line in [
            "/sketch show",
            "/sketch bg map.png",
            "/sketch token t1 Brom 1 2",
            "/sketch token t1 Brom 3.5 4",
        ] {
            match parse_command(line) {
                Ok(ConsoleCommand::Sketch(edit)) => edit.apply(&mut sketch),
                other => panic!("unexpected {:?}", other),
            }
        }

        assert!(sketch.displayed);
        assert_eq!(sketch.elements.len(), 2);
        assert_eq!(
            sketch.elements[0],
            SketchElement::Background {
                asset: "map.png".into()
            }
        );
        assert_eq!(
            sketch.elements[1],
            SketchElement::Token {
                id: "t1".into(),
                label: "Brom".into(),
                x: 3.5,
                y: 4.0,
                asset: None,
            }
        );
        assert!(parse_command("/sketch token t1 Brom left 4").is_err());

        SketchEdit::Clear.apply(&mut sketch);
        assert!(sketch.elements.is_empty());
    }

    #[test]
    fn test_format_entry() {
        let roll = LogEntry {
            seq: 9,
            timestamp: 0,
            author: Author::Participant("alice".into()),
            content: LogContent::Dice(DiceRoll {
                requester_id: "alice".into(),
                formula: DiceFormula::new(2, 6, 1),
                label: Some("damage".into()),
                visibility: RollVisibility::Private,
                rolls: vec![3, 4],
                total: 8,
            }),
            visibility: Visibility::MasterAnd("alice".into()),
        };
        assert_eq!(
            format_entry(&roll),
            "#9 alice rolled 2d6+1 for damage: [3, 4] = 8 (secret)"
        );

        let joined = LogEntry {
            seq: 2,
            timestamp: 0,
            author: Author::Server,
            content: LogContent::Joined {
                display_name: "Bob".into(),
                role: Role::Player,
            },
            visibility: Visibility::Everyone,
        };
        assert_eq!(format_entry(&joined), "#2 Bob joined as Player");
    }
}
