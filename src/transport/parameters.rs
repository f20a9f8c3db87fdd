//! Transport parameters (RFC 9000 Section 18).
//!
//! Exchanged as an opaque TLS extension during the handshake, encoded as a
//! concatenation of `(id, length, value)` triples, every integer varint
//! coded. Parameters at their default value are elided on encode; unknown
//! ids are skipped on decode.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::types::{ConnectionId, StatelessResetToken};
use crate::varint;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const ID_ORIGINAL_DESTINATION_CID: u64 = 0x00;
const ID_MAX_IDLE_TIMEOUT: u64 = 0x01;
const ID_STATELESS_RESET_TOKEN: u64 = 0x02;
const ID_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const ID_INITIAL_MAX_DATA: u64 = 0x04;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const ID_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const ID_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const ID_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const ID_ACK_DELAY_EXPONENT: u64 = 0x0a;
const ID_MAX_ACK_DELAY: u64 = 0x0b;
const ID_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const ID_PREFERRED_ADDRESS: u64 = 0x0d;
const ID_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const ID_INITIAL_SOURCE_CID: u64 = 0x0f;
const ID_RETRY_SOURCE_CID: u64 = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<ConnectionId>,

    /// Milliseconds; 0 disables the idle timeout.
    pub max_idle_timeout: u64,

    /// Server only.
    pub stateless_reset_token: Option<StatelessResetToken>,

    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,

    /// Milliseconds.
    pub max_ack_delay: u64,

    pub disable_active_migration: bool,

    /// Opaque preferred_address blob (server only); carried through without
    /// interpretation since migration is handled by the embedding layer.
    pub preferred_address: Option<Bytes>,

    pub active_connection_id_limit: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            preferred_address: None,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
        }
    }
}

impl TransportParameters {
    pub fn encode(&self, buf: &mut BytesMut) {
        fn write_param(buf: &mut BytesMut, id: u64, value: &[u8]) {
            varint::encode(buf, id);
            varint::encode(buf, value.len() as u64);
            buf.put_slice(value);
        }

        fn write_varint_param(buf: &mut BytesMut, id: u64, value: u64, default: u64) {
            if value == default {
                return;
            }
            let mut tmp = BytesMut::with_capacity(8);
            varint::encode(&mut tmp, value);
            write_param(buf, id, &tmp);
        }

        if let Some(cid) = &self.original_destination_connection_id {
            write_param(buf, ID_ORIGINAL_DESTINATION_CID, cid.as_bytes());
        }
        write_varint_param(buf, ID_MAX_IDLE_TIMEOUT, self.max_idle_timeout, 0);
        if let Some(token) = &self.stateless_reset_token {
            write_param(buf, ID_STATELESS_RESET_TOKEN, token);
        }
        write_varint_param(buf, ID_MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size, 65527);
        write_varint_param(buf, ID_INITIAL_MAX_DATA, self.initial_max_data, 0);
        write_varint_param(
            buf,
            ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
            0,
        );
        write_varint_param(
            buf,
            ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
            0,
        );
        write_varint_param(
            buf,
            ID_INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
            0,
        );
        write_varint_param(buf, ID_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi, 0);
        write_varint_param(buf, ID_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni, 0);
        write_varint_param(buf, ID_ACK_DELAY_EXPONENT, self.ack_delay_exponent, 3);
        write_varint_param(buf, ID_MAX_ACK_DELAY, self.max_ack_delay, 25);
        if self.disable_active_migration {
            write_param(buf, ID_DISABLE_ACTIVE_MIGRATION, &[]);
        }
        if let Some(addr) = &self.preferred_address {
            write_param(buf, ID_PREFERRED_ADDRESS, addr);
        }
        write_varint_param(
            buf,
            ID_ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
            2,
        );
        if let Some(cid) = &self.initial_source_connection_id {
            write_param(buf, ID_INITIAL_SOURCE_CID, cid.as_bytes());
        }
        if let Some(cid) = &self.retry_source_connection_id {
            write_param(buf, ID_RETRY_SOURCE_CID, cid.as_bytes());
        }
    }

    /// Decode and validate an extension body. Any malformation surfaces as
    /// TRANSPORT_PARAMETER_ERROR.
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let mut params = Self::default();

        let malformed = Error::TransportParameterError;
        while buf.has_remaining() {
            let id = varint::get(&mut buf).map_err(|_| malformed)?;
            let len = varint::get(&mut buf).map_err(|_| malformed)? as usize;
            if buf.remaining() < len {
                return Err(malformed);
            }
            let mut value = buf.split_to(len);

            let mut get_varint = |value: &mut Bytes| -> Result<u64> {
                let v = varint::get(value).map_err(|_| malformed)?;
                if value.has_remaining() {
                    return Err(malformed);
                }
                Ok(v)
            };

            match id {
                ID_ORIGINAL_DESTINATION_CID => {
                    params.original_destination_connection_id =
                        Some(ConnectionId::new(value).ok_or(malformed)?);
                }
                ID_MAX_IDLE_TIMEOUT => params.max_idle_timeout = get_varint(&mut value)?,
                ID_STATELESS_RESET_TOKEN => {
                    if value.len() != 16 {
                        return Err(malformed);
                    }
                    let mut token = [0u8; 16];
                    token.copy_from_slice(&value);
                    params.stateless_reset_token = Some(token);
                }
                ID_MAX_UDP_PAYLOAD_SIZE => params.max_udp_payload_size = get_varint(&mut value)?,
                ID_INITIAL_MAX_DATA => params.initial_max_data = get_varint(&mut value)?,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = get_varint(&mut value)?;
                }
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = get_varint(&mut value)?;
                }
                ID_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = get_varint(&mut value)?;
                }
                ID_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = get_varint(&mut value)?;
                }
                ID_INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = get_varint(&mut value)?;
                }
                ID_ACK_DELAY_EXPONENT => params.ack_delay_exponent = get_varint(&mut value)?,
                ID_MAX_ACK_DELAY => params.max_ack_delay = get_varint(&mut value)?,
                ID_DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(malformed);
                    }
                    params.disable_active_migration = true;
                }
                ID_PREFERRED_ADDRESS => params.preferred_address = Some(value),
                ID_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = get_varint(&mut value)?;
                }
                ID_INITIAL_SOURCE_CID => {
                    params.initial_source_connection_id =
                        Some(ConnectionId::new(value).ok_or(malformed)?);
                }
                ID_RETRY_SOURCE_CID => {
                    params.retry_source_connection_id =
                        Some(ConnectionId::new(value).ok_or(malformed)?);
                }
                _ => {
                    // Unknown parameters MUST be ignored.
                }
            }
        }

        params.validate()?;
        Ok(params)
    }

    /// Value constraints of RFC 9000 Section 18.2.
    pub fn validate(&self) -> Result<()> {
        if self.ack_delay_exponent > 20 {
            return Err(Error::TransportParameterError);
        }
        if self.max_ack_delay >= 1 << 14 {
            return Err(Error::TransportParameterError);
        }
        if self.active_connection_id_limit < 2 {
            return Err(Error::TransportParameterError);
        }
        if self.max_udp_payload_size < 1200 {
            return Err(Error::TransportParameterError);
        }
        Ok(())
    }
}
