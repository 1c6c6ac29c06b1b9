//! Tracing setup: console output plus the per-run audit log
//!
//! The audit layer is installed up front and stays silent until a collect
//! run points it at `<result-dir>/diag.log`.

use crate::output::OutputFormat;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

pub const AUDIT_LOG: &str = "diag.log";

/// Shared handle to the audit file
#[derive(Clone, Default)]
pub struct AuditLog {
    file: Arc<Mutex<Option<File>>>,
}

impl AuditLog {
    /// Start appending to `<dir>/diag.log`
    pub fn open(&self, dir: &Path) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(AUDIT_LOG))?;
        if let Ok(mut guard) = self.file.lock() {
            *guard = Some(file);
        }
        Ok(())
    }

    /// Stop writing to the audit file
    pub fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = file.flush();
            }
            *guard = None;
        }
    }
}

pub struct AuditWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for AuditWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.write(buf),
                None => Ok(buf.len()),
            },
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for AuditLog {
    type Writer = AuditWriter;

    fn make_writer(&'a self) -> Self::Writer {
        AuditWriter {
            file: self.file.clone(),
        }
    }
}

fn default_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// JSON lines into the audit file, whatever the console format
fn audit_layer<S>(audit: &AuditLog) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    fmt::layer()
        .json()
        .with_writer(audit.clone())
        .with_filter(EnvFilter::new("info,diag_lib=debug"))
}

/// Console layer on stderr plus the audit layer
fn subscriber(
    format: OutputFormat,
    verbose: bool,
    audit: &AuditLog,
) -> Box<dyn Subscriber + Send + Sync> {
    match format {
        OutputFormat::Json => Box::new(
            tracing_subscriber::registry()
                .with(audit_layer(audit))
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(io::stderr)
                        .with_filter(default_filter(verbose)),
                ),
        ),
        OutputFormat::Default => Box::new(
            tracing_subscriber::registry()
                .with(audit_layer(audit))
                .with(
                    fmt::layer()
                        .compact()
                        .with_writer(io::stderr)
                        .with_filter(default_filter(verbose)),
                ),
        ),
    }
}

/// Install the global subscriber and return the audit handle
pub fn init(format: OutputFormat, verbose: bool) -> AuditLog {
    let audit = AuditLog::default();
    subscriber(format, verbose, &audit).init();
    audit
}
