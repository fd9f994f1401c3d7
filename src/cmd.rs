/// Builder for a single command, packed as a RESP array of bulk strings.
///
/// Connections are not pipelined across callers, so one `Cmd` maps to
/// exactly one reply frame.
#[derive(Debug, Clone)]
pub(crate) struct Cmd {
    args: Vec<Vec<u8>>,
}

/// Shortcut to build a command with the given name.
pub(crate) fn cmd(name: &str) -> Cmd {
    Cmd {
        args: vec![name.as_bytes().to_vec()],
    }
}

impl Cmd {
    /// Appends an argument to the command.
    pub(crate) fn arg(mut self, arg: impl ToArg) -> Cmd {
        arg.write_arg(&mut self.args);
        self
    }

    /// Serializes the command for the wire.
    pub(crate) fn get_packed_command(&self) -> Vec<u8> {
        let mut int_buf = itoa::Buffer::new();
        let mut out = Vec::with_capacity(
            16 + self.args.iter().map(|a| a.len() + 16).sum::<usize>(),
        );
        out.push(b'*');
        out.extend_from_slice(int_buf.format(self.args.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        for arg in &self.args {
            out.push(b'$');
            out.extend_from_slice(int_buf.format(arg.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

/// Types that serialize to command arguments.
pub(crate) trait ToArg {
    fn write_arg(&self, out: &mut Vec<Vec<u8>>);
}

impl ToArg for &str {
    fn write_arg(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.as_bytes().to_vec());
    }
}

impl ToArg for &String {
    fn write_arg(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.as_bytes().to_vec());
    }
}

impl ToArg for String {
    fn write_arg(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.as_bytes().to_vec());
    }
}

impl ToArg for &[u8] {
    fn write_arg(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.to_vec());
    }
}

impl ToArg for &Vec<u8> {
    fn write_arg(&self, out: &mut Vec<Vec<u8>>) {
        out.push((*self).clone());
    }
}

impl ToArg for Vec<u8> {
    fn write_arg(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.clone());
    }
}

macro_rules! int_to_arg {
    ($($ty:ty),*) => {
        $(impl ToArg for $ty {
            fn write_arg(&self, out: &mut Vec<Vec<u8>>) {
                out.push(itoa::Buffer::new().format(*self).as_bytes().to_vec());
            }
        })*
    };
}

int_to_arg!(i64, u64, usize, u16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_get() {
        assert_eq!(
            cmd("GET").arg("key").get_packed_command(),
            b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n".to_vec()
        );
    }

    #[test]
    fn packs_mixed_args() {
        let packed = cmd("SET")
            .arg("k")
            .arg(b"v\r\n".as_slice())
            .arg("EX")
            .arg(42u64)
            .get_packed_command();
        assert_eq!(
            packed,
            b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$3\r\nv\r\n\r\n$2\r\nEX\r\n$2\r\n42\r\n".to_vec()
        );
    }
}
