//! Encoding of storage values as protocol parameters.

use ferry_protocol::{Param, Params, ProtocolError, ProtocolResult};
use ferry_types::{StorageInfo, StorageType};

fn type_from_code(code: &str) -> ProtocolResult<StorageType> {
    Ok(match code {
        "f" => StorageType::File,
        "p" => StorageType::Path,
        "l" => StorageType::Link,
        "s" => StorageType::Special,
        "-" => StorageType::Missing,
        other => return Err(ProtocolError::Parameter(format!("unknown storage type '{other}'"))),
    })
}

fn opt_u32(value: Option<u32>) -> Param {
    value.map_or(Param::Null, Param::from)
}

pub fn encode_info(info: &StorageInfo) -> Param {
    Param::List(vec![
        Param::from(info.name.as_str()),
        Param::from(info.kind.code().to_string()),
        Param::UInt(info.size),
        Param::Int(info.time_modified),
        opt_u32(info.user_id),
        Param::opt_str(info.user.as_deref()),
        opt_u32(info.group_id),
        Param::opt_str(info.group.as_deref()),
        opt_u32(info.mode),
        Param::opt_str(info.link_destination.as_deref()),
        Param::opt_str(info.etag.as_deref()),
        Param::opt_str(info.checksum.as_deref()),
    ])
}

pub fn decode_info(value: &Param) -> ProtocolResult<StorageInfo> {
    let Param::List(fields) = value else {
        return Err(ProtocolError::Parameter(format!(
            "storage info expected list, found {}",
            value.type_name()
        )));
    };
    let mut params = Params::new(fields);
    let name = params.str()?.to_string();
    let mut info = StorageInfo::new(type_from_code(params.str()?)?).with_name(name);
    info.size = params.u64()?;
    info.time_modified = params.i64()?;
    info.user_id = params.opt_u32()?;
    info.user = params.opt_str()?.map(str::to_string);
    info.group_id = params.opt_u32()?;
    info.group = params.opt_str()?.map(str::to_string);
    info.mode = params.opt_u32()?;
    info.link_destination = params.opt_str()?.map(str::to_string);
    info.etag = params.opt_str()?.map(str::to_string);
    info.checksum = params.opt_str()?.map(str::to_string);
    Ok(info)
}
