use crate::access::bencode::{BRefAccess, RefKind};

/// Encode the given bencode value into the output buffer.
///
/// Dictionary keys are emitted in ascending byte order, which the backing
/// `BTreeMap` guarantees.
pub fn encode<T>(bencode: &T, output: &mut Vec<u8>)
where
    T: BRefAccess,
    T::BKey: AsRef<[u8]>,
{
    match bencode.kind() {
        RefKind::Int(value) => encode_int(value, output),
        RefKind::Bytes(bytes) => encode_bytes(bytes, output),
        RefKind::List(list) => {
            output.push(crate::LIST_START);

            for index in 0..list.len() {
                encode(list.get(index).unwrap(), output);
            }

            output.push(crate::BEN_END);
        }
        RefKind::Dict(dict) => {
            output.push(crate::DICT_START);

            for (key, value) in dict.to_list() {
                encode_bytes(key.as_ref(), output);
                encode(value, output);
            }

            output.push(crate::BEN_END);
        }
    }
}

fn encode_int(value: i64, output: &mut Vec<u8>) {
    output.push(crate::INT_START);
    output.extend_from_slice(value.to_string().as_bytes());
    output.push(crate::BEN_END);
}

fn encode_bytes(bytes: &[u8], output: &mut Vec<u8>) {
    output.extend_from_slice(bytes.len().to_string().as_bytes());
    output.push(crate::BYTE_LEN_END);
    output.extend_from_slice(bytes);
}
