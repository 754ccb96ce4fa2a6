//! Line-debugger engine capability
//!
//! The session never interprets debugger commands itself. It hands the
//! channel's byte streams to a [`LineDebugger`] and acts on how the engine
//! says the interaction ended.

use std::io::{BufRead, Write};

/// How an interactive pause ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Let the host run on; the session stays attached for the next breakpoint
    Continue,
    /// The operator ended the session
    Quit,
    /// The input stream ran dry
    Eof,
}

impl Resume {
    /// Whether the session must be torn down after this outcome
    pub fn ends_session(self) -> bool {
        !matches!(self, Resume::Continue)
    }
}

pub trait LineDebugger: Send {
    /// Attach the engine's command input and output
    fn bind(&mut self, input: Box<dyn BufRead + Send>, output: Box<dyn Write + Send>);

    fn set_prompt(&mut self, _prompt: &str) {}

    /// Describe the execution point the next pause happens at
    fn set_location(&mut self, _location: &str) {}

    /// Run the interactive loop at the current execution point
    fn run_until_pause(&mut self) -> anyhow::Result<Resume>;
}

const HELP: &str = "\
Documented commands:
  c, cont, continue   resume the program
  q, quit, exit       end the debug session
  w, where            show the current location
  h, help             show this help
";

/// Bare-bones engine used by the demo host: just enough to continue and quit
pub struct CommandLoop {
    location: String,
    prompt: String,
    input: Option<Box<dyn BufRead + Send>>,
    output: Option<Box<dyn Write + Send>>,
}

impl CommandLoop {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            prompt: "(rdb) ".to_string(),
            input: None,
            output: None,
        }
    }
}

impl LineDebugger for CommandLoop {
    fn bind(&mut self, input: Box<dyn BufRead + Send>, output: Box<dyn Write + Send>) {
        self.input = Some(input);
        self.output = Some(output);
    }

    fn set_prompt(&mut self, prompt: &str) {
        self.prompt = prompt.to_string();
    }

    fn set_location(&mut self, location: &str) {
        self.location = location.to_string();
    }

    fn run_until_pause(&mut self) -> anyhow::Result<Resume> {
        let (Some(input), Some(output)) = (self.input.as_mut(), self.output.as_mut()) else {
            anyhow::bail!("engine is not bound to a channel");
        };

        writeln!(output, "> {}", self.location)?;
        loop {
            write!(output, "{}", self.prompt)?;
            output.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                writeln!(output)?;
                return Ok(Resume::Eof);
            }

            match line.trim() {
                "" => {}
                "c" | "cont" | "continue" => return Ok(Resume::Continue),
                "q" | "quit" | "exit" => return Ok(Resume::Quit),
                "w" | "where" => writeln!(output, "> {}", self.location)?,
                "h" | "help" => write!(output, "{}", HELP)?,
                other => writeln!(output, "*** Unknown syntax: {}", other)?,
            }
        }
    }
}
