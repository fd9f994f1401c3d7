use sha1_smol::Sha1;

use crate::cmd::cmd;
use crate::connection::Conn;
use crate::errors::RimcuResult;
use crate::types::Value;

/// Represents a lua script.
///
/// Invocation tries `EVALSHA` first and uploads the source with `EVAL`
/// when the server does not know the hash yet. The object is immutable
/// and can be shared.
#[derive(Debug, Clone)]
pub(crate) struct Script {
    code: String,
    hash: String,
}

impl Script {
    /// Creates a new script object.
    pub(crate) fn new(code: &str) -> Script {
        let mut hash = Sha1::new();
        hash.update(code.as_bytes());
        Script {
            code: code.to_string(),
            hash: hash.digest().to_string(),
        }
    }

    /// Invokes the script with the given `KEYS` and `ARGV`.
    pub(crate) async fn invoke(
        &self,
        con: &mut Conn,
        keys: &[Vec<u8>],
        args: &[Vec<u8>],
    ) -> RimcuResult<Value> {
        let pack = |name: &str, body: &str| {
            let mut c = cmd(name).arg(body).arg(keys.len());
            for key in keys {
                c = c.arg(key);
            }
            for arg in args {
                c = c.arg(arg);
            }
            c
        };

        match con.do_cmd(&pack("EVALSHA", &self.hash)).await {
            Err(err) if err.server_code() == Some("NOSCRIPT") => {
                con.do_cmd(&pack("EVAL", &self.code)).await
            }
            other => other,
        }
    }
}
