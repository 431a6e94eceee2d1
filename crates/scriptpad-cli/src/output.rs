//! Terminal rendering of streamed result events.

use scriptpad_core::{Diagnostic, ExceptionInfo, OutputStream, ResultEvent, Severity};

use crate::colors;

/// Prints events as they arrive and counts compile errors.
#[derive(Default)]
pub struct Printer {
    errors: usize,
}

impl Printer {
    pub fn print_batch(&mut self, batch: &[ResultEvent]) {
        for event in batch {
            self.print_event(event);
        }
    }

    /// Number of Error-severity diagnostics printed so far.
    pub fn errors(&self) -> usize {
        self.errors
    }

    fn print_event(&mut self, event: &ResultEvent) {
        match event {
            ResultEvent::Value {
                header,
                type_name,
                display,
            } => print_value(header.as_deref(), type_name, display),
            ResultEvent::Output {
                stream: OutputStream::Stdout,
                text,
            } => println!("{}", text),
            ResultEvent::Output {
                stream: OutputStream::Stderr,
                text,
            } => eprintln!("{}", text),
            ResultEvent::Diagnostic(diagnostic) => {
                if diagnostic.is_error() {
                    self.errors += 1;
                }
                print_diagnostic(diagnostic);
            }
            ResultEvent::Exception(exception) => print_exception(exception),
        }
    }
}

fn print_value(header: Option<&str>, type_name: &str, display: &str) {
    match header {
        Some(header) => println!(
            "{}{}:{} {} {}({}){}",
            colors::CYAN,
            header,
            colors::RESET,
            display,
            colors::DIM,
            type_name,
            colors::RESET
        ),
        None => println!(
            "{} {}({}){}",
            display,
            colors::DIM,
            type_name,
            colors::RESET
        ),
    }
}

pub fn print_diagnostic(diagnostic: &Diagnostic) {
    let color = match diagnostic.severity {
        Severity::Error => colors::RED,
        Severity::Warning => colors::YELLOW,
        Severity::Info => colors::DIM,
    };
    let source = diagnostic.source.as_deref().unwrap_or("<submission>");
    eprintln!(
        "{}{}[{}]{} {}:{}:{}: {}",
        color,
        diagnostic.severity,
        diagnostic.code,
        colors::RESET,
        source,
        diagnostic.span.line,
        diagnostic.span.column,
        diagnostic.message
    );
}

pub fn print_exception(exception: &ExceptionInfo) {
    for (depth, exception) in exception.chain().enumerate() {
        let prefix = if depth == 0 { "" } else { " ---> " };
        eprintln!(
            "{}{}{}{}:{} {}",
            prefix,
            colors::RED,
            colors::BOLD,
            exception.type_name,
            colors::RESET,
            exception.message
        );
        for frame in &exception.stack {
            eprintln!("   {}{}{}", colors::DIM, frame, colors::RESET);
        }
    }
}
