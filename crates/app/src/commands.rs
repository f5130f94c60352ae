/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New,
    List,
    /// List index from the last `/list`, or a conversation id.
    Open(String),
    Delete(String),
    Retry,
    Help,
    Quit,
    Unknown(String),
    Empty,
}

pub const HELP: &str = "\
commands:
  /new            start a new conversation
  /list           list saved conversations
  /open <n|id>    open a conversation from the last listing
  /delete <n|id>  delete a conversation
  /retry          regenerate the last reply
  /help           show this help
  /quit           exit
anything else is sent as a message; press ctrl-c to stop a reply";

impl Command {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        let Some(command) = trimmed.strip_prefix('/') else {
            return Self::Send(trimmed.to_string());
        };

        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (command, ""),
        };

        match (name, argument) {
            ("new", _) => Self::New,
            ("list" | "ls", _) => Self::List,
            ("open", target) if !target.is_empty() => Self::Open(target.to_string()),
            ("delete" | "rm", target) if !target.is_empty() => Self::Delete(target.to_string()),
            ("retry", _) => Self::Retry,
            ("help" | "?", _) => Self::Help,
            ("quit" | "exit" | "q", _) => Self::Quit,
            _ => Self::Unknown(trimmed.to_string()),
        }
    }
}
