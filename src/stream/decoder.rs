//! Turns `DATA_RECORDS` responses into batches.
//!
//! Records arrive already decoded and carry their own table metadata, so
//! there is no schema cache. The only job is positioning: every batch
//! ends at the ack id the server attached to it.

use super::message::{DataRecord, ResponseResult};
use crate::batch::EventBatch;
use crate::error::{ClientError, Result};
use crate::position::Position;

#[derive(Debug)]
pub struct StreamDecoder {
    endpoint: String,
    batches: u64,
}

impl StreamDecoder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            batches: 0,
        }
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Decode one result. Anything other than `DATA_RECORDS` is a
    /// protocol error; an empty record list yields nothing.
    pub fn decode(&mut self, result: ResponseResult) -> Result<Option<EventBatch<DataRecord>>> {
        let ResponseResult::DataRecords {
            streaming_id,
            ack_id,
            records,
        } = result
        else {
            return Err(ClientError::protocol(format!(
                "expected data records on {}",
                self.endpoint
            )));
        };
        if streaming_id.is_empty() || ack_id.is_empty() {
            return Err(ClientError::protocol(format!(
                "data records without streaming or ack id on {}",
                self.endpoint
            )));
        }
        if records.is_empty() {
            return Ok(None);
        }
        self.batches += 1;
        let position = Position::stream(streaming_id, ack_id.clone());
        Ok(Some(EventBatch::new(records, position).with_ack_id(ack_id)))
    }
}
