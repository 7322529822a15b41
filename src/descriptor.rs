//! Decoding of the out-of-band request headers.
//!
//! The engine never puts the description of a call inside the streamed messages. It is sent
//! as protobuf-encoded gRPC binary metadata attached to the call, under one of the header keys
//! below. Decoding is pure and stateless; any failure is fatal for the call it belongs to.

use prost::Message;
use tonic::metadata::MetadataMap;
use tracing::warn;

use crate::error::{Error, ErrorKind, Result};
use crate::function::FunctionTable;
use crate::proto::sse as proto;

pub use crate::proto::sse::{DataType, FunctionType};

/// Header carrying a `FunctionRequestHeader` on `ExecuteFunction` calls.
pub const FUNCTION_REQUEST_HEADER: &str = "qlik-functionrequestheader-bin";

/// Header carrying a `ScriptRequestHeader` on `EvaluateScript` calls.
pub const SCRIPT_REQUEST_HEADER: &str = "qlik-scriptrequestheader-bin";

/// Optional header carrying a `CommonRequestHeader` on both streaming calls.
pub const COMMON_REQUEST_HEADER: &str = "qlik-commonrequestheader-bin";

/// A declared parameter of a function or script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub data_type: DataType,
}

impl Param {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

impl From<&Param> for proto::Parameter {
    fn from(value: &Param) -> Self {
        proto::Parameter {
            data_type: value.data_type as i32,
            name: value.name.clone(),
        }
    }
}

/// Everything the server needs to know about one call, decoded from its request header.
///
/// For function calls the calling convention, parameters and return type are taken from the
/// registered definition, never from the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub function_id: i32,
    pub function_type: FunctionType,
    pub params: Vec<Param>,
    pub return_type: DataType,
    /// Script text, present only for `EvaluateScript` calls.
    pub script: Option<String>,
}

impl RequestDescriptor {
    pub fn is_script(&self) -> bool {
        self.script.is_some()
    }
}

/// Raw bytes of the binary header `key`. Absent or non-binary metadata is a decode error.
pub fn read_header(metadata: &MetadataMap, key: &str) -> Result<Vec<u8>> {
    let value = metadata.get_bin(key).ok_or_else(|| {
        Error::ConnectorError(ErrorKind::DecodeError(format!(
            "request header {key} is missing"
        )))
    })?;
    let bytes = value.to_bytes().map_err(|e| {
        Error::ConnectorError(ErrorKind::DecodeError(format!(
            "request header {key} is not valid binary metadata: {e}"
        )))
    })?;
    Ok(bytes.to_vec())
}

/// Decodes a `FunctionRequestHeader` and resolves its function id against `functions`.
pub fn decode_function_header(bytes: &[u8], functions: &FunctionTable) -> Result<RequestDescriptor> {
    let header = proto::FunctionRequestHeader::decode(bytes).map_err(|e| {
        Error::FunctionError(ErrorKind::DecodeError(format!(
            "invalid function request header: {e}"
        )))
    })?;
    let function = functions.resolve(header.function_id)?;
    Ok(function.descriptor())
}

/// Decodes a `ScriptRequestHeader`.
///
/// Unknown function or parameter types are decode errors, an unknown return type is reported as
/// [`ErrorKind::InvalidReturnType`].
pub fn decode_script_header(bytes: &[u8]) -> Result<RequestDescriptor> {
    let header = proto::ScriptRequestHeader::decode(bytes).map_err(|e| {
        Error::ScriptError(ErrorKind::DecodeError(format!(
            "invalid script request header: {e}"
        )))
    })?;

    let function_type = FunctionType::try_from(header.function_type).map_err(|_| {
        Error::ScriptError(ErrorKind::DecodeError(format!(
            "unknown function type {}",
            header.function_type
        )))
    })?;

    let params = header
        .params
        .into_iter()
        .map(|param| {
            let data_type = DataType::try_from(param.data_type).map_err(|_| {
                Error::ScriptError(ErrorKind::DecodeError(format!(
                    "parameter {} has unknown data type {}",
                    param.name, param.data_type
                )))
            })?;
            Ok(Param::new(param.name, data_type))
        })
        .collect::<Result<Vec<_>>>()?;

    let return_type = DataType::try_from(header.return_type)
        .map_err(|_| Error::ScriptError(ErrorKind::InvalidReturnType(header.return_type)))?;

    Ok(RequestDescriptor {
        function_id: -1,
        function_type,
        params,
        return_type,
        script: Some(header.script),
    })
}

/// Decodes the optional common header. It carries no semantics, so a malformed one is logged
/// and ignored.
pub fn decode_common_header(metadata: &MetadataMap) -> Option<proto::CommonRequestHeader> {
    let value = metadata.get_bin(COMMON_REQUEST_HEADER)?;
    let decoded = value
        .to_bytes()
        .map_err(|e| e.to_string())
        .and_then(|bytes| {
            proto::CommonRequestHeader::decode(bytes.as_ref()).map_err(|e| e.to_string())
        });
    match decoded {
        Ok(header) => Some(header),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed common request header");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    fn script_header(function_type: i32, return_type: i32, params: Vec<(i32, &str)>) -> Vec<u8> {
        proto::ScriptRequestHeader {
            script: "args[0] + args[1]".to_string(),
            function_type,
            return_type,
            params: params
                .into_iter()
                .map(|(data_type, name)| proto::Parameter {
                    data_type,
                    name: name.to_string(),
                })
                .collect(),
        }
        .encode_to_vec()
    }

    #[test]
    fn function_header_resolves_registered_definition() {
        let table = FunctionTable::builtin();
        let bytes = proto::FunctionRequestHeader {
            function_id: 2,
            version: "1.0".to_string(),
        }
        .encode_to_vec();

        let descriptor = decode_function_header(&bytes, &table).unwrap();
        assert_eq!(descriptor.function_id, 2);
        assert_eq!(descriptor.function_type, FunctionType::Aggregation);
        assert_eq!(descriptor.return_type, DataType::Numeric);
        assert_eq!(descriptor.params, vec![Param::new("column", DataType::Numeric)]);
        assert!(!descriptor.is_script());
    }

    #[test]
    fn function_header_with_unknown_id() {
        let table = FunctionTable::builtin();
        let bytes = proto::FunctionRequestHeader {
            function_id: 99,
            version: String::new(),
        }
        .encode_to_vec();

        let err = decode_function_header(&bytes, &table).unwrap_err();
        assert!(matches!(
            err.kind(),
            Some(ErrorKind::UnknownFunction(99))
        ));
    }

    #[test]
    fn garbage_function_header() {
        let table = FunctionTable::builtin();
        let err = decode_function_header(&[0xff, 0xff, 0xff], &table).unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::DecodeError(_))));
    }

    #[test]
    fn script_header_decodes() {
        let bytes = script_header(
            FunctionType::Tensor as i32,
            DataType::Dual as i32,
            vec![(DataType::Numeric as i32, "a"), (DataType::String as i32, "b")],
        );

        let descriptor = decode_script_header(&bytes).unwrap();
        assert_eq!(descriptor.function_type, FunctionType::Tensor);
        assert_eq!(descriptor.return_type, DataType::Dual);
        assert_eq!(
            descriptor.params,
            vec![
                Param::new("a", DataType::Numeric),
                Param::new("b", DataType::String)
            ]
        );
        assert_eq!(descriptor.script.as_deref(), Some("args[0] + args[1]"));
    }

    #[test]
    fn script_header_schema_violations() {
        let bytes = script_header(7, DataType::String as i32, vec![]);
        let err = decode_script_header(&bytes).unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::DecodeError(_))));

        let bytes = script_header(
            FunctionType::Scalar as i32,
            DataType::String as i32,
            vec![(9, "x")],
        );
        let err = decode_script_header(&bytes).unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::DecodeError(_))));

        let bytes = script_header(FunctionType::Scalar as i32, 5, vec![]);
        let err = decode_script_header(&bytes).unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::InvalidReturnType(5))));
    }

    #[test]
    fn read_missing_header() {
        let metadata = MetadataMap::new();
        let err = read_header(&metadata, FUNCTION_REQUEST_HEADER).unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectorError(ErrorKind::DecodeError(_))
        ));
    }

    #[test]
    fn read_present_header() {
        let mut metadata = MetadataMap::new();
        metadata.insert_bin(
            FUNCTION_REQUEST_HEADER,
            MetadataValue::from_bytes(&[8, 3]),
        );
        assert_eq!(
            read_header(&metadata, FUNCTION_REQUEST_HEADER).unwrap(),
            vec![8, 3]
        );
    }

    #[test]
    fn common_header_is_optional() {
        let mut metadata = MetadataMap::new();
        assert!(decode_common_header(&metadata).is_none());

        let bytes = proto::CommonRequestHeader {
            app_id: "app".to_string(),
            cardinality: 12,
            user_id: "UserDirectory=X; UserId=y".to_string(),
        }
        .encode_to_vec();
        metadata.insert_bin(COMMON_REQUEST_HEADER, MetadataValue::from_bytes(&bytes));
        let header = decode_common_header(&metadata).unwrap();
        assert_eq!(header.app_id, "app");
        assert_eq!(header.cardinality, 12);

        metadata.insert_bin(
            COMMON_REQUEST_HEADER,
            MetadataValue::from_bytes(&[0xff, 0xff]),
        );
        assert!(decode_common_header(&metadata).is_none());
    }
}
