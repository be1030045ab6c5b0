//! Startup and authentication.

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::{Opts, SslMode};
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, ReadyForQuery, msg_type,
};
use crate::protocol::frontend::auth::{ScramClient, md5_password};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_ssl_request,
    write_startup,
};
use crate::protocol::types::TransactionStatus;

use super::action::{Action, StateMachine, async_message, unexpected};

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    WaitingSslResponse,
    SslHandshake,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
}

/// Drives a fresh socket to the first ReadyForQuery.
pub struct ConnectionStateMachine<'a> {
    state: ConnectionState,
    opts: &'a Opts,
    ssl_response: Option<u8>,
    scram: Option<ScramClient>,
    backend_key: Option<BackendKeyData>,
    transaction_status: TransactionStatus,
}

impl<'a> ConnectionStateMachine<'a> {
    pub fn new(opts: &'a Opts) -> Self {
        Self {
            state: ConnectionState::Initial,
            opts,
            ssl_response: None,
            scram: None,
            backend_key: None,
            transaction_status: TransactionStatus::Idle,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Session key sent during startup; servers behind some poolers omit it.
    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.backend_key
    }

    fn password(&self) -> Result<&'a str> {
        self.opts
            .password
            .as_deref()
            .ok_or_else(|| {
                Error::Auth("the server requested a password but none is configured".into())
            })
    }

    fn write_startup_message(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let opts = self.opts;
        let mut params: Vec<(&str, &str)> =
            vec![("user", opts.user.as_str()), ("client_encoding", "UTF8")];
        if let Some(db) = &opts.database {
            params.push(("database", db));
        }
        if let Some(app) = &opts.application_name {
            params.push(("application_name", app));
        }
        params.extend(opts.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        write_startup(&mut buffer_set.write_buffer, &params)?;
        self.state = ConnectionState::WaitingAuth;
        Ok(Action::WriteAndReadMessage)
    }

    fn handle_auth(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if buffer_set.type_byte != msg_type::AUTHENTICATION {
            return Err(unexpected("while authenticating", buffer_set.type_byte));
        }
        let out = &mut buffer_set.write_buffer;
        match AuthenticationMessage::parse(&buffer_set.read_buffer)? {
            AuthenticationMessage::Ok => {
                self.state = ConnectionState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            AuthenticationMessage::CleartextPassword => {
                write_password(out, self.password()?)?;
                self.state = ConnectionState::WaitingAuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Md5Password { salt } => {
                let hashed = md5_password(&self.opts.user, self.password()?, &salt);
                write_password(out, &hashed)?;
                self.state = ConnectionState::WaitingAuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                if !mechanisms.contains(&SCRAM_SHA_256) {
                    return Err(Error::Auth(format!(
                        "no supported SASL mechanism among {mechanisms:?}"
                    )));
                }
                let scram = ScramClient::new(self.password()?);
                let first = scram.client_first_message();
                write_sasl_initial_response(out, SCRAM_SHA_256, first.as_bytes())?;
                self.scram = Some(scram);
                self.state = ConnectionState::SaslInProgress;
                Ok(Action::WriteAndReadMessage)
            }
            other => Err(Error::Unsupported(format!(
                "authentication method {other:?}"
            ))),
        }
    }

    fn handle_sasl(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if buffer_set.type_byte != msg_type::AUTHENTICATION {
            return Err(unexpected("during SASL exchange", buffer_set.type_byte));
        }
        let scram = self
            .scram
            .as_mut()
            .ok_or_else(|| Error::Protocol("SASL message before SASL start".into()))?;

        match AuthenticationMessage::parse(&buffer_set.read_buffer)? {
            AuthenticationMessage::SaslContinue { data } => {
                let client_final = scram.process_server_first(sasl_text(data)?)?;
                write_sasl_response(&mut buffer_set.write_buffer, client_final.as_bytes())?;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::SaslFinal { data } => {
                scram.verify_server_final(sasl_text(data)?)?;
                self.state = ConnectionState::WaitingAuthResult;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!("unexpected SASL message {other:?}"))),
        }
    }

    fn handle_auth_result(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match (buffer_set.type_byte, AuthenticationMessage::parse(&buffer_set.read_buffer)) {
            (msg_type::AUTHENTICATION, Ok(AuthenticationMessage::Ok)) => {
                self.state = ConnectionState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            (type_byte, _) => Err(unexpected("instead of AuthenticationOk", type_byte)),
        }
    }

    fn handle_ready(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match buffer_set.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                self.backend_key = Some(BackendKeyData::parse(&buffer_set.read_buffer)?);
                Ok(Action::ReadMessage)
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => Ok(Action::ReadMessage),
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(&buffer_set.read_buffer)?.status;
                self.state = ConnectionState::Ready;
                Ok(Action::Finished)
            }
            other => Err(unexpected("during startup", other)),
        }
    }
}

fn sasl_text(data: &[u8]) -> Result<&str> {
    simdutf8::compat::from_utf8(data).map_err(|e| Error::Auth(format!("invalid SASL message: {e}")))
}

impl StateMachine for ConnectionStateMachine<'_> {
    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match self.state {
            ConnectionState::Initial => {
                if self.opts.ssl_mode == SslMode::Disable {
                    return self.write_startup_message(buffer_set);
                }
                write_ssl_request(&mut buffer_set.write_buffer)?;
                self.state = ConnectionState::WaitingSslResponse;
                return Ok(Action::WriteAndReadByte);
            }
            ConnectionState::WaitingSslResponse => {
                return match self.ssl_response.take() {
                    Some(b'S') => {
                        self.state = ConnectionState::SslHandshake;
                        Ok(Action::TlsHandshake)
                    }
                    Some(b'N') if self.opts.ssl_mode == SslMode::Require => Err(Error::Auth(
                        "SSL required but not supported by the server".into(),
                    )),
                    Some(b'N') => self.write_startup_message(buffer_set),
                    other => Err(Error::Protocol(format!(
                        "unexpected SSL response {other:?}"
                    ))),
                };
            }
            ConnectionState::SslHandshake => return self.write_startup_message(buffer_set),
            ConnectionState::Ready => {
                return Err(Error::Protocol("startup already finished".into()));
            }
            _ => {}
        }

        if let Some(action) = async_message(buffer_set)? {
            return Ok(action);
        }
        if buffer_set.type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&buffer_set.read_buffer)?;
            return Err(Error::Server(error.0));
        }

        match self.state {
            ConnectionState::WaitingAuth => self.handle_auth(buffer_set),
            ConnectionState::SaslInProgress => self.handle_sasl(buffer_set),
            ConnectionState::WaitingAuthResult => self.handle_auth_result(buffer_set),
            _ => self.handle_ready(buffer_set),
        }
    }

    fn set_ssl_response(&mut self, byte: u8) {
        self.ssl_response = Some(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buffer_set: &mut BufferSet, type_byte: u8, payload: &[u8]) {
        buffer_set.type_byte = type_byte;
        buffer_set.read_buffer.clear();
        buffer_set.read_buffer.extend_from_slice(payload);
        buffer_set.write_buffer.clear();
    }

    fn opts(ssl_mode: SslMode, password: Option<&str>) -> Opts {
        Opts {
            user: "alice".into(),
            password: password.map(str::to_string),
            ssl_mode,
            ..Opts::default()
        }
    }

    #[test]
    fn trust_auth() {
        let opts = opts(SslMode::Disable, None);
        let mut sm = ConnectionStateMachine::new(&opts);
        let mut bs = BufferSet::new();

        assert!(matches!(sm.step(&mut bs), Ok(Action::WriteAndReadMessage)));
        assert!(bs.write_buffer.windows(6).any(|w| w == b"alice\0"));

        feed(&mut bs, b'R', &[0, 0, 0, 0]);
        assert!(matches!(sm.step(&mut bs), Ok(Action::ReadMessage)));
        feed(&mut bs, b'S', b"TimeZone\0UTC\0");
        assert!(matches!(
            sm.step(&mut bs),
            Ok(Action::HandleAsyncMessageAndReadMessage(_))
        ));
        feed(&mut bs, b'K', &[0, 0, 0, 42, 1, 2, 3, 4]);
        assert!(matches!(sm.step(&mut bs), Ok(Action::ReadMessage)));
        feed(&mut bs, b'Z', b"I");
        assert!(matches!(sm.step(&mut bs), Ok(Action::Finished)));
        assert_eq!(sm.state(), ConnectionState::Ready);
        assert_eq!(sm.backend_key().map(|k| k.process_id), Some(42));
    }

    #[test]
    fn md5_without_password_fails() {
        let opts = opts(SslMode::Disable, None);
        let mut sm = ConnectionStateMachine::new(&opts);
        let mut bs = BufferSet::new();
        assert!(sm.step(&mut bs).is_ok());
        feed(&mut bs, b'R', &[0, 0, 0, 5, 9, 9, 9, 9]);
        assert!(matches!(sm.step(&mut bs), Err(Error::Auth(_))));
    }

    #[test]
    fn ssl_refused_falls_back_when_preferred() {
        let opts = opts(SslMode::Prefer, Some("pw"));
        let mut sm = ConnectionStateMachine::new(&opts);
        let mut bs = BufferSet::new();
        assert!(matches!(sm.step(&mut bs), Ok(Action::WriteAndReadByte)));
        sm.set_ssl_response(b'N');
        bs.write_buffer.clear();
        assert!(matches!(sm.step(&mut bs), Ok(Action::WriteAndReadMessage)));
        assert_eq!(sm.state(), ConnectionState::WaitingAuth);
    }

    #[test]
    fn ssl_refused_fails_when_required() {
        let opts = opts(SslMode::Require, None);
        let mut sm = ConnectionStateMachine::new(&opts);
        let mut bs = BufferSet::new();
        assert!(sm.step(&mut bs).is_ok());
        sm.set_ssl_response(b'N');
        assert!(matches!(sm.step(&mut bs), Err(Error::Auth(_))));
    }

    #[test]
    fn server_error_during_startup() {
        let opts = opts(SslMode::Disable, None);
        let mut sm = ConnectionStateMachine::new(&opts);
        let mut bs = BufferSet::new();
        assert!(sm.step(&mut bs).is_ok());
        feed(&mut bs, b'E', b"SFATAL\0C3D000\0Mdatabase \"x\" does not exist\0\0");
        let err = sm.step(&mut bs).err();
        assert_eq!(err.as_ref().and_then(Error::sqlstate), Some("3D000"));
    }
}
