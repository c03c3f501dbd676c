use std::io::{self, BufRead, Write};

use colored::Colorize;

const MAX_ATTEMPTS: usize = 3;

/// Line-oriented operator dialogue.
///
/// Reads answers from any `BufRead` so tests can script a session; the
/// binary wires it to stdin and stdout. Logs go to stderr.
pub struct Console {
    input: Box<dyn BufRead + Send>,
    output: Box<dyn Write + Send>,
}

impl Console {
    pub fn stdio() -> Self {
        Self::new(io::BufReader::new(io::stdin()), io::stdout())
    }

    pub fn new(input: impl BufRead + Send + 'static, output: impl Write + Send + 'static) -> Self {
        Self {
            input: Box::new(input),
            output: Box::new(output),
        }
    }

    pub fn say(&mut self, line: impl AsRef<str>) -> io::Result<()> {
        writeln!(self.output, "{}", line.as_ref())
    }

    /// `None` on end of input.
    fn read_answer(&mut self) -> io::Result<Option<String>> {
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    /// `[y/N]` question; anything but an explicit yes is a no.
    pub fn confirm(&mut self, question: &str) -> io::Result<bool> {
        write!(self.output, "{question} [y/N] ")?;
        let answer = self.read_answer()?.unwrap_or_default().to_ascii_lowercase();
        Ok(answer == "y" || answer == "yes")
    }

    /// Ask the operator to retype `expected` exactly.
    pub fn confirm_by_typing(&mut self, question: &str, expected: &str) -> io::Result<bool> {
        write!(self.output, "{question}\nType `{}` to confirm: ", expected.bold())?;
        Ok(self.read_answer()?.as_deref() == Some(expected))
    }

    /// Numbered menu; an empty answer takes `default`.
    pub fn choose(&mut self, label: &str, options: &[String], default: usize) -> io::Result<usize> {
        if options.is_empty() {
            let msg = format!("no choices for {label}");
            return Err(io::Error::new(io::ErrorKind::InvalidInput, msg));
        }
        let default = default.min(options.len() - 1);

        writeln!(self.output, "{}", label.bold())?;
        for (i, option) in options.iter().enumerate() {
            let marker = if i == default { "*" } else { " " };
            writeln!(self.output, " {marker}{:>2}) {option}", i + 1)?;
        }

        for _ in 0..MAX_ATTEMPTS {
            write!(self.output, "Choice [{}]: ", default + 1)?;
            let Some(answer) = self.read_answer()? else {
                return Err(eof(label));
            };
            if answer.is_empty() {
                return Ok(default);
            }
            match answer.parse::<usize>() {
                Ok(n) if (1..=options.len()).contains(&n) => return Ok(n - 1),
                _ => writeln!(self.output, "  pick a number between 1 and {}", options.len())?,
            }
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no valid choice for {label}"),
        ))
    }

    /// Free-form answer; an empty answer takes `default` when there is one.
    pub fn text(&mut self, label: &str, default: Option<&str>) -> io::Result<String> {
        match default {
            Some(d) => write!(self.output, "{label} [{d}]: ")?,
            None => write!(self.output, "{label}: ")?,
        }
        let Some(answer) = self.read_answer()? else {
            return Err(eof(label));
        };
        Ok(match (answer.is_empty(), default) {
            (true, Some(d)) => d.to_string(),
            _ => answer,
        })
    }

    /// Read a secret without echoing it. Always talks to the terminal.
    pub fn secret(&mut self, label: &str) -> io::Result<String> {
        self.output.flush()?;
        rpassword::prompt_password(format!("{label}: "))
    }
}

fn eof(label: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("input closed while asking for {label}"))
}
