use serde::{Deserialize, Serialize};

use crate::errors::{Error, ErrorKind, RimcuResult};
use crate::slot::key_slot;

/// Invalidation record published on the strings channel.
///
/// Subscribers drop records whose `client_id` equals their own: that is
/// the writer's echo, already accounted for locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Notif {
    #[serde(with = "serde_bytes")]
    pub client_id: Vec<u8>,
    pub key: String,
    pub slot: u64,
}

impl Notif {
    pub(crate) fn new(client_id: &[u8], key: &str) -> Notif {
        Notif {
            client_id: client_id.to_vec(),
            key: key.to_string(),
            slot: u64::from(key_slot(key.as_bytes())),
        }
    }

    pub(crate) fn encode(&self) -> RimcuResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(encode_error)
    }

    pub(crate) fn decode(data: &[u8]) -> RimcuResult<Notif> {
        rmp_serde::from_slice(data).map_err(decode_error)
    }
}

/// Commands carried by list notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum ListCmd {
    Rpush,
    Lpop,
}

/// Notification of a list write, correlated with its originating
/// operation through `op_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ListNotif {
    #[serde(with = "serde_bytes")]
    pub client_id: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub op_id: Vec<u8>,
    pub cmd: ListCmd,
    pub key: String,
    pub arg: String,
}

impl ListNotif {
    pub(crate) fn new(
        client_id: &[u8],
        op_id: Vec<u8>,
        cmd: ListCmd,
        key: &str,
        arg: &str,
    ) -> ListNotif {
        ListNotif {
            client_id: client_id.to_vec(),
            op_id,
            cmd,
            key: key.to_string(),
            arg: arg.to_string(),
        }
    }

    pub(crate) fn encode(&self) -> RimcuResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(encode_error)
    }

    pub(crate) fn decode(data: &[u8]) -> RimcuResult<ListNotif> {
        rmp_serde::from_slice(data).map_err(decode_error)
    }
}

fn encode_error(err: rmp_serde::encode::Error) -> Error {
    Error::from((ErrorKind::Parse, "failed to encode notification", err.to_string()))
}

fn decode_error(err: rmp_serde::decode::Error) -> Error {
    Error::from((ErrorKind::Parse, "failed to decode notification", err.to_string()))
}
