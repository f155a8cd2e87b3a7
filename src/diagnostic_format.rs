// Diagnostic formatting for CLI
use hostembed_core::{Diagnostic, EmbeddingError};

pub fn format_diagnostic(diagnostic: &Diagnostic) -> String {
    let mut output = String::new();

    output.push_str(&format!("Error [{}]\n", diagnostic.code));
    output.push_str(&format!("{}\n", diagnostic.title));
    output.push('\n');

    for (key, value) in &diagnostic.fields {
        output.push_str(&format!("{}: {}\n", key, value));
    }

    if let Some(hint) = &diagnostic.hint {
        output.push('\n');
        output.push_str(&format!("hint: {}\n", hint));
    }

    output
}

/// Prints the error's diagnostic to stderr and exits with status 1.
pub fn fail(err: &EmbeddingError) -> ! {
    tracing::debug!(code = err.code(), "command failed");
    eprintln!("{}", format_diagnostic(&err.diagnostic()));
    std::process::exit(1);
}
