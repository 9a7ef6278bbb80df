//! The no-op handler: never reads a body, never replies. Grounded on the original's
//! `NopMessageHandler`, which always reports header length 0 and an empty response.

use crate::handler::{HeaderResult, ResponsePacket};

#[derive(Debug, Default)]
pub struct NopHandler;

impl NopHandler {
    pub fn new() -> Self {
        NopHandler
    }

    pub fn parse_header(&mut self, _buf: &[u8]) -> HeaderResult {
        HeaderResult::ok(0)
    }

    pub fn parse_message(&mut self, _header: &[u8], _body: &[u8]) -> ResponsePacket {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_asks_for_a_body() {
        let mut handler = NopHandler::new();
        assert_eq!(handler.parse_header(&[1, 2, 3]).length, 0);
    }

    #[test]
    fn never_replies() {
        let mut handler = NopHandler::new();
        assert!(handler.parse_message(&[], &[1, 2, 3]).is_empty());
    }
}
