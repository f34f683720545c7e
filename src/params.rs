//! In-memory parameter table served by `tether_server`.
//!
//! Clients `SET` named parameters, `GET` them back and `TRANSMIT` numbered samples that
//! accumulate per key. One [`ParameterStore`] is shared by every connection; cloning it
//! clones the handle, not the data.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::trace;

use crate::{
    Command,
    protocol::{HandlerError, Processor, Request, RequestQueue},
};

/// One `TRANSMIT`ted sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub step: i32,
    pub value: f64,
}

#[derive(Debug, Default)]
struct Series {
    samples: Vec<Sample>,
    finished: bool,
}

#[derive(Debug, Default)]
struct Tables {
    parameters: HashMap<String, f64>,
    series: HashMap<String, Series>,
}

#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    tables: Arc<Mutex<Tables>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.lock().parameters.get(key).copied()
    }

    pub fn set(&self, key: &str, value: f64) {
        self.lock().parameters.insert(key.to_string(), value);
    }

    /// Samples received for `key`, in arrival order.
    pub fn samples(&self, key: &str) -> Vec<Sample> {
        self.lock()
            .series
            .get(key)
            .map(|s| s.samples.clone())
            .unwrap_or_default()
    }

    /// Whether the final sample of `key` has arrived.
    pub fn is_finished(&self, key: &str) -> bool {
        self.lock().series.get(key).is_some_and(|s| s.finished)
    }

    /// Append a sample, returning how many `key` now holds.
    pub fn record(&self, key: &str, sample: Sample, last: bool) -> usize {
        let mut tables = self.lock();
        let series = tables.series.entry(key.to_string()).or_default();
        series.samples.push(sample);
        series.finished |= last;
        series.samples.len()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Processor for ParameterStore {
    fn process(&mut self, request: &Request, responses: &RequestQueue) -> Result<(), HandlerError> {
        let key = request.str_at(0).unwrap_or_default();

        let response = match request.command() {
            Command::Set => {
                let value = request.double_at(1).unwrap_or_default();
                self.set(key, value);
                Request::ack(true, key)
            }
            Command::Get => match self.get(key) {
                Some(value) => Request::value(key, value),
                None => Request::ack(false, format!("unknown parameter '{key}'")),
            },
            Command::Transmit => {
                let sample = Sample {
                    step: request.int_at(1).unwrap_or_default(),
                    value: request.double_at(2).unwrap_or_default(),
                };
                let last = request.bool_at(3).unwrap_or_default();
                let count = self.record(key, sample, last);

                let suffix = if last { " (final)" } else { "" };
                Request::ack(true, format!("{key}: {count} samples{suffix}"))
            }
            other => return Err(HandlerError::Unsupported(other)),
        };

        responses.push(request.reply(response));
        Ok(())
    }

    fn post_process(&mut self, request: &Request, _responses: &RequestQueue) {
        trace!("parameter store handled '{}'", request.command());
    }
}
