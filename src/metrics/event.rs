//! Event metric: every matched atom, in timestamp order.

use crate::core::types::Atom;
use crate::report::{EventRecord, MetricData};

#[derive(Debug)]
pub struct EventProducer {
    records: Vec<EventRecord>,
    condition_met: bool,
}

impl EventProducer {
    pub fn new(condition_met: bool) -> Self {
        Self {
            records: Vec::new(),
            condition_met,
        }
    }

    pub fn on_matched_event(&mut self, atom: &Atom) {
        if !self.condition_met {
            return;
        }
        self.records.push(EventRecord {
            elapsed_timestamp_ns: atom.elapsed_timestamp_ns(),
            atom: atom.clone(),
        });
    }

    pub fn on_condition_changed(&mut self, met: bool) {
        self.condition_met = met;
    }

    pub fn dump(&mut self, clear: bool) -> MetricData {
        let mut records = if clear {
            std::mem::take(&mut self.records)
        } else {
            self.records.clone()
        };
        records.sort_by_key(|r| r.elapsed_timestamp_ns);
        MetricData::Event(records)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
