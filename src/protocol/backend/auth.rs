//! Startup-phase messages: authentication requests, parameter status, ReadyForQuery.

use crate::error::{Error, Result};
use crate::protocol::codec::{read_bytes, read_cstr, read_i32, read_u8, read_u32};
use crate::protocol::types::TransactionStatus;

#[derive(Debug)]
pub enum AuthenticationMessage<'a> {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<&'a str> },
    SaslContinue { data: &'a [u8] },
    SaslFinal { data: &'a [u8] },
    /// Kerberos, GSS, SSPI; carries the raw request code.
    Unsupported(i32),
}

impl<'a> AuthenticationMessage<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (code, rest) = read_i32(payload)?;
        Ok(match code {
            0 => Self::Ok,
            3 => Self::CleartextPassword,
            5 => {
                let (salt, _) = read_bytes(rest, 4)?;
                let mut buf = [0; 4];
                buf.copy_from_slice(salt);
                Self::Md5Password { salt: buf }
            }
            10 => {
                let mut mechanisms = Vec::new();
                let mut data = rest;
                while data.first().is_some_and(|&b| b != 0) {
                    let (mechanism, tail) = read_cstr(data)?;
                    mechanisms.push(mechanism);
                    data = tail;
                }
                Self::Sasl { mechanisms }
            }
            11 => Self::SaslContinue { data: rest },
            12 => Self::SaslFinal { data: rest },
            2 | 7 | 8 | 9 => Self::Unsupported(code),
            other => {
                return Err(Error::Protocol(format!(
                    "unknown authentication request {other}"
                )));
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct ParameterStatus<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

impl<'a> ParameterStatus<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (name, rest) = read_cstr(payload)?;
        let (value, _) = read_cstr(rest)?;
        Ok(Self { name, value })
    }
}

/// BackendKeyData: identifies the session in a CancelRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    pub process_id: u32,
    pub secret_key: u32,
}

impl BackendKeyData {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (process_id, rest) = read_u32(payload)?;
        let (secret_key, _) = read_u32(rest)?;
        Ok(Self {
            process_id,
            secret_key,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (byte, _) = read_u8(payload)?;
        let status = TransactionStatus::from_byte(byte).ok_or_else(|| {
            Error::Protocol(format!("ReadyForQuery: unknown status {byte:#x}"))
        })?;
        Ok(Self { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sasl_mechanisms() {
        let payload = b"\0\0\0\x0aSCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0";
        match AuthenticationMessage::parse(payload) {
            Ok(AuthenticationMessage::Sasl { mechanisms }) => {
                assert_eq!(mechanisms, ["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn md5_salt() {
        let payload = [0, 0, 0, 5, 1, 2, 3, 4];
        assert!(matches!(
            AuthenticationMessage::parse(&payload),
            Ok(AuthenticationMessage::Md5Password { salt: [1, 2, 3, 4] })
        ));
    }

    #[test]
    fn ready_for_query_status() {
        assert_eq!(
            ReadyForQuery::parse(b"T").ok().map(|r| r.status),
            Some(TransactionStatus::InTransaction)
        );
        assert!(ReadyForQuery::parse(b"?").is_err());
    }
}
