//! Stages used by unit tests across the crate.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{Context, Signal, Stage};
use crate::error::Result;

/// Forwards everything.
pub(crate) struct Passthrough;

impl Stage for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }
}

/// What a [`Recorder`] or [`WireTap`] saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Record {
    Data(Bytes),
    SignalFromDown(&'static str),
    SignalFromUp(&'static str),
}

pub(crate) type Records = Arc<Mutex<Vec<Record>>>;

/// Application-side recorder.
///
/// Records data arriving from below without forwarding it, and records and
/// forwards every signal.
pub(crate) struct Recorder {
    records: Records,
}

impl Recorder {
    pub(crate) fn new() -> (Self, Records) {
        let records = Records::default();
        (
            Self {
                records: Arc::clone(&records),
            },
            records,
        )
    }
}

impl Stage for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn fetch_data_from_down(&mut self, _ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        self.records.lock().push(Record::Data(data));
        Ok(())
    }

    fn fetch_signal_from_down(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        self.records.lock().push(Record::SignalFromDown(signal.name()));
        ctx.dispatch_signal_up(signal)
    }

    fn fetch_signal_from_up(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        self.records.lock().push(Record::SignalFromUp(signal.name()));
        ctx.dispatch_signal_down(signal)
    }
}

/// Transport-side tap.
///
/// Captures data leaving the chain downward (the "wire") and records
/// signals arriving from above; everything else passes through.
pub(crate) struct WireTap {
    records: Records,
}

impl WireTap {
    pub(crate) fn new() -> (Self, Records) {
        let records = Records::default();
        (
            Self {
                records: Arc::clone(&records),
            },
            records,
        )
    }
}

impl Stage for WireTap {
    fn name(&self) -> &'static str {
        "wiretap"
    }

    fn fetch_data_from_up(&mut self, _ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        self.records.lock().push(Record::Data(data));
        Ok(())
    }

    fn fetch_signal_from_up(&mut self, ctx: &mut Context<'_>, signal: Signal) -> Result<()> {
        self.records.lock().push(Record::SignalFromUp(signal.name()));
        ctx.dispatch_signal_down(signal)
    }
}

/// Data captured by a recorder or tap, in order.
pub(crate) fn captured(records: &Records) -> Vec<Bytes> {
    records
        .lock()
        .iter()
        .filter_map(|record| match record {
            Record::Data(data) => Some(data.clone()),
            _ => None,
        })
        .collect()
}

/// Signals captured by a recorder or tap, in order, regardless of direction.
pub(crate) fn signals(records: &Records) -> Vec<&'static str> {
    records
        .lock()
        .iter()
        .filter_map(|record| match record {
            Record::SignalFromDown(name) | Record::SignalFromUp(name) => Some(*name),
            Record::Data(_) => None,
        })
        .collect()
}
