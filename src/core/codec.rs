// Payload codecs: how a caller's record becomes the opaque bytes a pool stores.
use serde_json::Value;

use crate::core::error::{Error, ErrorKind};

pub trait RecordCodec {
    type Record;

    fn serialize(&self, record: &Self::Record) -> Result<Vec<u8>, Error>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Record, Error>;
}

/// Stores payload bytes unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

impl RecordCodec for RawCodec {
    type Record = Vec<u8>;

    fn serialize(&self, record: &Vec<u8>) -> Result<Vec<u8>, Error> {
        Ok(record.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(bytes.to_vec())
    }
}

/// Stores one compact JSON document per record.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl RecordCodec for JsonCodec {
    type Record = Value;

    fn serialize(&self, record: &Value) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(record).map_err(|err| {
            Error::new(ErrorKind::Usage).with_message(format!("record is not encodable: {err}"))
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, Error> {
        serde_json::from_slice(bytes).map_err(|err| {
            Error::new(ErrorKind::Corrupt).with_message(format!("record is not valid JSON: {err}"))
        })
    }
}
