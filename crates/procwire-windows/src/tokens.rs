use crate::protocol::StreamId;
use rand::RngCore;
use tokio_util::bytes::{BufMut, BytesMut};

/// One-time tokens for a single wrapper launch.
///
/// Tokens 0..3 are presented by the wrapper per stream, tokens 3..6 are sent
/// back by the server so the wrapper can tell it reached the right listener.
pub struct SecurityTokens {
    size: usize,
    tokens: [Vec<u8>; 6],
}

impl SecurityTokens {
    pub fn generate(size: usize) -> Self {
        let mut rng = rand::rng();
        let tokens = std::array::from_fn(|_| {
            let mut token = vec![0u8; size];
            rng.fill_bytes(&mut token);
            token
        });
        Self { size, tokens }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn client(&self, stream: StreamId) -> &[u8] {
        &self.tokens[stream.index()]
    }

    pub fn server(&self, stream: StreamId) -> &[u8] {
        &self.tokens[stream.index() + 3]
    }

    pub fn verify_client(&self, stream: StreamId, candidate: &[u8]) -> bool {
        constant_time_eq(self.client(stream), candidate)
    }

    /// Bytes written to the wrapper's stdin: all six tokens, NUL, command, NUL.
    pub fn wrapper_payload(&self, command: &str) -> BytesMut {
        let mut payload = BytesMut::with_capacity(self.size * 6 + command.len() + 2);
        for token in &self.tokens {
            payload.put_slice(token);
        }
        payload.put_u8(0);
        payload.put_slice(command.as_bytes());
        payload.put_u8(0);
        payload
    }
}

impl std::fmt::Debug for SecurityTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityTokens")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Compares without short-circuiting on the first differing byte.
pub fn constant_time_eq(expected: &[u8], candidate: &[u8]) -> bool {
    if expected.len() != candidate.len() {
        return false;
    }

    expected
        .iter()
        .zip(candidate)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_distinct_and_sized() {
        let tokens = SecurityTokens::generate(16);
        assert_eq!(tokens.client(StreamId::Stdin).len(), 16);
        assert_ne!(tokens.client(StreamId::Stdin), tokens.client(StreamId::Stdout));
        assert_ne!(tokens.client(StreamId::Stdin), tokens.server(StreamId::Stdin));
        assert!(!format!("{tokens:?}").contains(&format!("{:?}", tokens.client(StreamId::Stdin))));
    }

    #[test]
    fn test_verify_client() {
        let tokens = SecurityTokens::generate(8);
        let good = tokens.client(StreamId::Stdout).to_vec();
        assert!(tokens.verify_client(StreamId::Stdout, &good));
        assert!(!tokens.verify_client(StreamId::Stderr, &good));
        assert!(!tokens.verify_client(StreamId::Stdout, &good[..7]));
        assert!(!tokens.verify_client(StreamId::Stdout, tokens.server(StreamId::Stdout)));
    }

    #[test]
    fn test_wrapper_payload_layout() {
        let tokens = SecurityTokens::generate(8);
        let payload = tokens.wrapper_payload("cmd /c exit 3");

        assert_eq!(payload.len(), 8 * 6 + 1 + "cmd /c exit 3".len() + 1);
        assert_eq!(&payload[..8], tokens.client(StreamId::Stdin));
        assert_eq!(&payload[40..48], tokens.server(StreamId::Stderr));
        assert_eq!(payload[48], 0);
        assert_eq!(&payload[49..payload.len() - 1], b"cmd /c exit 3");
        assert_eq!(payload[payload.len() - 1], 0);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(constant_time_eq(b"", b""));
    }
}
