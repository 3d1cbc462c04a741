//! Stop replies: the packets that tell GDB why the target halted.

use buffer::Buffer;
use hex;

/// The flavor of a stop reply, one letter each on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopType {
    /// `S` - stopped by a signal.
    Signal,
    /// `T` - stopped by a signal, with extra key/value reports.
    SignalExtended,
    /// `W` - the process exited.
    ProcessExited,
    /// `X` - the process terminated with a signal.
    ProcessTerminated,
    /// `O` - console output from the target.
    Output,
}

/// Why execution stopped, as reported to the debugger.
#[derive(Debug, Clone)]
pub struct StopReason {
    pub kind: StopType,
    pub code: u8,
    pub additional: String,
}

impl StopReason {
    pub fn new(kind: StopType, code: u8, additional: &str) -> Self {
        StopReason {
            kind,
            code,
            additional: additional.to_owned(),
        }
    }

    /// The stop reason reported for software breakpoints and finished
    /// steps: SIGTRAP on the one emulated thread.
    pub fn breakpoint() -> Self {
        StopReason::new(
            StopType::SignalExtended,
            5,
            "swbreak:;thread:p1.1;core:1;",
        )
    }

    pub fn letter(kind: StopType) -> u8 {
        match kind {
            StopType::Signal => b'S',
            StopType::SignalExtended => b'T',
            StopType::ProcessExited => b'W',
            StopType::ProcessTerminated => b'X',
            StopType::Output => b'O',
        }
    }

    /// Appends the wire form: the letter, the code as two hex digits
    /// (except for output packets) and the report string verbatim.
    pub fn encode(&self, out: &mut Buffer) {
        out.write_u8(StopReason::letter(self.kind));
        if self.kind != StopType::Output {
            hex::encode_uint(u64::from(self.code), 1, out, true);
        }
        out.write_str(&self.additional);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(reason: &StopReason) -> String {
        let mut buf = Buffer::new();
        reason.encode(&mut buf);
        buf.get_string()
    }

    #[test]
    fn breakpoint_stop_encoding() {
        assert_eq!(
            encoded(&StopReason::breakpoint()),
            "T05swbreak:;thread:p1.1;core:1;"
        );
    }

    #[test]
    fn plain_signal() {
        assert_eq!(encoded(&StopReason::new(StopType::Signal, 0, "")), "S00");
    }

    #[test]
    fn exit_code() {
        assert_eq!(
            encoded(&StopReason::new(StopType::ProcessExited, 0x2a, "")),
            "W2a"
        );
    }

    #[test]
    fn output_skips_the_code() {
        assert_eq!(
            encoded(&StopReason::new(StopType::Output, 0, "4869")),
            "O4869"
        );
    }
}
