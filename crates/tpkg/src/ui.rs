//! User-interface capability
//!
//! The crate reports user-facing errors (like missing packages) through the
//! [`Ui`] trait. An operation may report multiple messages; when it wasn't
//! successful it reports the error and then returns
//! [`Error::AlreadyReported`], indicating to the caller that the operation
//! failed but nothing further needs to be printed.

use crate::error::Error;

/// Sink for user-facing messages.
pub trait Ui {
    /// Signals an error to the user.
    fn error(&self, message: &str);

    /// Signals a warning to the user.
    fn warning(&self, message: &str);

    /// Reports interesting information.
    fn info(&self, message: &str);

    /// Reports an error message and returns [`Error::AlreadyReported`].
    fn report_error(&self, message: &str) -> Error {
        self.error(message);
        Error::AlreadyReported
    }

    /// Surfaces a typed error once and passes it on unchanged.
    ///
    /// [`Error::AlreadyReported`] passes through silently.
    fn report(&self, err: Error) -> Error {
        if !err.is_already_reported() {
            self.error(&err.to_string());
        }
        err
    }
}

/// A [`Ui`] that prints to stdout.
#[derive(Debug, Default)]
pub struct FmtUi;

impl Ui for FmtUi {
    fn error(&self, message: &str) {
        println!("Error: {message}");
    }

    fn warning(&self, message: &str) {
        println!("Warning: {message}");
    }

    fn info(&self, message: &str) {
        println!("Info: {message}");
    }
}

/// A [`Ui`] that swallows all messages.
#[derive(Debug, Default)]
pub struct NullUi;

impl Ui for NullUi {
    fn error(&self, _message: &str) {}

    fn warning(&self, _message: &str) {}

    fn info(&self, _message: &str) {}
}

/// A [`Ui`] that records messages, for assertions in tests.
#[derive(Debug, Default)]
pub struct CaptureUi {
    messages: std::sync::Mutex<Vec<String>>,
}

impl CaptureUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages reported so far, in order.
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    fn push(&self, message: String) {
        self.messages.lock().unwrap().push(message);
    }
}

impl Ui for CaptureUi {
    fn error(&self, message: &str) {
        self.push(format!("Error: {message}"));
    }

    fn warning(&self, message: &str) {
        self.push(format!("Warning: {message}"));
    }

    fn info(&self, message: &str) {
        self.push(format!("Info: {message}"));
    }
}
