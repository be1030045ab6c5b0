//! Simple query protocol.

use crate::buffer_set::BufferSet;
use crate::error::Result;
use crate::handler::ResultHandler;
use crate::protocol::frontend::write_query;
use crate::protocol::types::TransactionStatus;

use super::action::{Action, StateMachine};
use super::response::ResponseReader;

/// One Query message and its responses.
///
/// The query may hold several statements; each result reaches the handler in order.
pub struct SimpleQueryStateMachine<'a, H> {
    query: Option<&'a str>,
    reader: ResponseReader<'a, H>,
}

impl<'a, H: ResultHandler> SimpleQueryStateMachine<'a, H> {
    pub fn new(handler: &'a mut H, query: &'a str) -> Self {
        Self {
            query: Some(query),
            reader: ResponseReader::new(handler, false),
        }
    }
}

impl<H: ResultHandler> StateMachine for SimpleQueryStateMachine<'_, H> {
    fn transaction_status(&self) -> TransactionStatus {
        self.reader.transaction_status()
    }

    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if let Some(query) = self.query.take() {
            write_query(&mut buffer_set.write_buffer, query)?;
            return Ok(Action::WriteAndReadMessage);
        }
        self.reader.read(buffer_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::handler::CollectHandler;
    use crate::transport::RawResult;

    fn feed(bs: &mut BufferSet, type_byte: u8, payload: &[u8]) {
        bs.type_byte = type_byte;
        bs.read_buffer.clear();
        bs.read_buffer.extend_from_slice(payload);
        bs.write_buffer.clear();
    }

    const DESC: [u8; 22] = [0, 1, b'n', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 23, 0, 4, 0, 0, 0, 0, 0, 0];

    #[test]
    fn select_rows() {
        let mut handler = CollectHandler::new();
        let mut bs = BufferSet::new();
        {
            let mut sm = SimpleQueryStateMachine::new(&mut handler, "SELECT 1 AS n");
            assert!(matches!(sm.step(&mut bs), Ok(Action::WriteAndReadMessage)));
            assert_eq!(bs.write_buffer.first(), Some(&b'Q'));

            feed(&mut bs, b'T', &DESC);
            assert!(matches!(sm.step(&mut bs), Ok(Action::ReadMessage)));
            feed(&mut bs, b'D', &[0, 1, 0, 0, 0, 1, b'1']);
            assert!(matches!(sm.step(&mut bs), Ok(Action::ReadMessage)));
            feed(&mut bs, b'C', b"SELECT 1\0");
            assert!(matches!(sm.step(&mut bs), Ok(Action::ReadMessage)));
            feed(&mut bs, b'Z', b"I");
            assert!(matches!(sm.step(&mut bs), Ok(Action::Finished)));
        }
        match handler.into_result() {
            RawResult::Rows { rows, .. } => assert_eq!(rows.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_surfaces_after_ready() {
        let mut handler = CollectHandler::new();
        let mut bs = BufferSet::new();
        let mut sm = SimpleQueryStateMachine::new(&mut handler, "SELEC 1");
        assert!(sm.step(&mut bs).is_ok());

        feed(&mut bs, b'E', b"SERROR\0C42601\0Msyntax error\0\0");
        assert!(matches!(sm.step(&mut bs), Ok(Action::ReadMessage)));
        feed(&mut bs, b'N', b"SNOTICE\0Mhello\0\0");
        assert!(matches!(
            sm.step(&mut bs),
            Ok(Action::HandleAsyncMessageAndReadMessage(_))
        ));
        feed(&mut bs, b'Z', b"I");
        let err = sm.step(&mut bs).err();
        assert_eq!(err.as_ref().and_then(Error::sqlstate), Some("42601"));
    }

    #[test]
    fn copy_in_is_refused() {
        let mut handler = CollectHandler::new();
        let mut bs = BufferSet::new();
        let mut sm = SimpleQueryStateMachine::new(&mut handler, "COPY t FROM STDIN");
        assert!(sm.step(&mut bs).is_ok());
        feed(&mut bs, b'G', &[0, 0, 0]);
        assert!(matches!(sm.step(&mut bs), Ok(Action::WriteAndReadMessage)));
        assert_eq!(bs.write_buffer.first(), Some(&b'f'));
        // no Sync in simple mode
        assert!(!bs.write_buffer.ends_with(&[b'S', 0, 0, 0, 4]));
    }
}
