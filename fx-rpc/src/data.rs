use {
    serde::{Serialize, Deserialize},
    thiserror::Error,
};

/// Value passed to or returned from a function.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum TypedData {
    Null,
    String(String),
    Json(String),
    Bytes(Vec<u8>),
    Int(i64),
    Double(f64),
    Bool(bool),
}

/// How the payload of a shared memory region should be interpreted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RpcDataType {
    Unknown,
    String,
    Bytes,
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum DataError {
    #[error("shared memory payload is not valid utf-8")]
    InvalidUtf8,

    #[error("shared memory payload has unknown data type")]
    UnknownDataType,
}

impl TypedData {
    /// Data type used when the value travels through shared memory, `None` if it cannot.
    pub fn shared_memory_type(&self) -> Option<RpcDataType> {
        match self {
            Self::String(_) => Some(RpcDataType::String),
            Self::Bytes(_) => Some(RpcDataType::Bytes),
            _ => None,
        }
    }

    /// Raw payload of values that can be placed into shared memory.
    pub fn payload_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(v) => Some(v.as_bytes()),
            Self::Bytes(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn from_shared_memory(bytes: Vec<u8>, data_type: RpcDataType) -> Result<Self, DataError> {
        match data_type {
            RpcDataType::Bytes => Ok(Self::Bytes(bytes)),
            RpcDataType::String => String::from_utf8(bytes)
                .map(Self::String)
                .map_err(|_| DataError::InvalidUtf8),
            RpcDataType::Unknown => Err(DataError::UnknownDataType),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) | Self::Json(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Converts to json for display. Bytes are rendered as an array of numbers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::String(v) => serde_json::Value::String(v.clone()),
            Self::Json(v) => serde_json::from_str(v).unwrap_or_else(|_| serde_json::Value::String(v.clone())),
            Self::Bytes(v) => serde_json::Value::Array(v.iter().map(|b| serde_json::Value::from(*b)).collect()),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Double(v) => serde_json::Value::from(*v),
            Self::Bool(v) => serde_json::Value::Bool(*v),
        }
    }
}

impl From<&str> for TypedData {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for TypedData {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for TypedData {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<i64> for TypedData {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Reference to a payload placed into a shared memory region instead of the frame itself.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct RpcSharedMemory {
    pub name: String,
    pub offset: u64,
    pub count: u64,
    pub data_type: RpcDataType,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ParameterData {
    Data(TypedData),
    SharedMemory(RpcSharedMemory),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParameterBinding {
    pub name: String,
    pub data: ParameterData,
}

impl ParameterBinding {
    pub fn inline(name: impl Into<String>, data: TypedData) -> Self {
        Self {
            name: name.into(),
            data: ParameterData::Data(data),
        }
    }

    pub fn shared_memory(name: impl Into<String>, shared_memory: RpcSharedMemory) -> Self {
        Self {
            name: name.into(),
            data: ParameterData::SharedMemory(shared_memory),
        }
    }

    pub fn shared_memory_ref(&self) -> Option<&RpcSharedMemory> {
        match &self.data {
            ParameterData::SharedMemory(v) => Some(v),
            ParameterData::Data(_) => None,
        }
    }
}
