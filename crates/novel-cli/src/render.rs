use std::collections::BTreeMap;
use std::io::{self, Write};

use novel_stream::{Author, Ledger, LedgerDelta};

/// Prints ledger changes incrementally, one labeled block per message.
#[derive(Debug, Default)]
pub struct StreamPrinter {
    current: Option<usize>,
    printed: BTreeMap<usize, String>,
}

impl StreamPrinter {
    pub fn show(
        &mut self,
        ledger: &Ledger,
        change: LedgerDelta,
        out: &mut impl Write,
    ) -> io::Result<()> {
        match change {
            LedgerDelta::Opened { index, .. } | LedgerDelta::Appended { index, .. } => {
                self.switch_to(ledger, index, out)?;
                self.print_tail(ledger, index, out)?;
            }
            LedgerDelta::Finalized { index, .. } => {
                let text = text_at(ledger, index);
                let continues = self.current == Some(index)
                    && self
                        .printed
                        .get(&index)
                        .is_some_and(|shown| !shown.is_empty() && text.starts_with(shown.as_str()));
                if continues {
                    self.print_tail(ledger, index, out)?;
                    writeln!(out)?;
                } else {
                    self.close(out)?;
                    writeln!(out, "[{}]", label(ledger, index))?;
                    writeln!(out, "{text}")?;
                }
                self.printed.insert(index, text.to_string());
                self.current = None;
            }
            LedgerDelta::Notice { index } => {
                self.close(out)?;
                writeln!(out, "[{}] {}", label(ledger, index), text_at(ledger, index))?;
            }
            LedgerDelta::Ended => self.close(out)?,
        }
        out.flush()
    }

    fn switch_to(&mut self, ledger: &Ledger, index: usize, out: &mut impl Write) -> io::Result<()> {
        if self.current == Some(index) {
            return Ok(());
        }
        self.close(out)?;
        writeln!(out, "[{}]", label(ledger, index))?;
        self.current = Some(index);
        Ok(())
    }

    fn print_tail(&mut self, ledger: &Ledger, index: usize, out: &mut impl Write) -> io::Result<()> {
        let text = text_at(ledger, index);
        let shown = self.printed.entry(index).or_default();
        match text.strip_prefix(shown.as_str()) {
            Some(tail) => write!(out, "{tail}")?,
            None => write!(out, "\n{text}")?,
        }
        *shown = text.to_string();
        Ok(())
    }

    /// Ends an open block, if any.
    pub fn close(&mut self, out: &mut impl Write) -> io::Result<()> {
        if self.current.take().is_some() {
            writeln!(out)?;
        }
        Ok(())
    }
}

fn text_at(ledger: &Ledger, index: usize) -> &str {
    ledger
        .messages()
        .get(index)
        .map(|m| ledger.display_text(m))
        .unwrap_or_default()
}

fn label(ledger: &Ledger, index: usize) -> String {
    match ledger.messages().get(index).map(|m| m.author) {
        Some(Author::Agent(agent)) => agent.to_string(),
        Some(Author::User) => "user".to_string(),
        Some(Author::System) | None => "system".to_string(),
    }
}
