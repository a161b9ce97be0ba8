//! Wire format for the seven RDT message types.
//!
//! All multi-byte integers are big-endian. Every message shares a 4-byte
//! common header; handshake messages additionally carry a 4-byte
//! `ver_and_type` extension and a `lteid`, and REQ is further prefixed by a
//! 4-byte magic.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use failure::Fail;

use crate::config::HANDSHAKE_REQ_MAGIC;

/// `ctrl_id` values carried in bits 1..7 of header byte 0.
pub const CTRL_HANDSHAKE: u8 = 0;
pub const CTRL_KEEPALIVE: u8 = 1;
pub const CTRL_DATA_ACK: u8 = 2;
pub const CTRL_SHUTDOWN: u8 = 3;

/// `handshake_type` carried in bits 14..15 of `ver_and_type`.
pub const HANDSHAKE_REQ: u8 = 0;
pub const HANDSHAKE_RESP: u8 = 1;
pub const HANDSHAKE_FIN: u8 = 2;

const HEADER_LEN: usize = 4;
const HANDSHAKE_EXT_LEN: usize = 6; // ver_and_type(4) + lteid(2)

#[derive(Debug, Fail)]
pub enum DecodeError {
    #[fail(display = "datagram too short for {}: {} byte(s)", what, len)]
    TooShort { what: &'static str, len: usize },
    #[fail(display = "unknown ctrl_id {}", _0)]
    UnknownCtrl(u8),
    #[fail(display = "unknown handshake_type {}", _0)]
    UnknownHandshakeType(u8),
}

/// The common 4-byte header present on every RDT message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub is_ctrl: bool,
    pub ctrl_id: u8,
    pub rteid: u16,
}

impl Header {
    fn encode(&self, buf: &mut BytesMut) {
        let byte0 = if self.is_ctrl {
            0x1 | ((self.ctrl_id & 0x7f) << 1)
        } else {
            0x0
        };
        buf.put_u8(byte0);
        buf.put_u8(0); // reserved
        buf.put_u16_be(self.rteid);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::TooShort {
                what: "header",
                len: buf.len(),
            });
        }
        let byte0 = buf[0];
        let is_ctrl = byte0 & 0x1 != 0;
        let ctrl_id = (byte0 >> 1) & 0x7f;
        let rteid = BigEndian::read_u16(&buf[2..4]);
        buf.advance(HEADER_LEN);
        Ok(Header {
            is_ctrl,
            ctrl_id,
            rteid,
        })
    }
}

/// `ver_and_type`: `version:14 | handshake_type:2`, packed big-endian into a
/// 4-byte field followed by the 2-byte `lteid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HandshakeExt {
    version: u16,
    handshake_type: u8,
    lteid: u16,
}

impl HandshakeExt {
    fn encode(&self, buf: &mut BytesMut) {
        let packed = (self.version & 0x3fff) as u32 | ((self.handshake_type & 0x3) as u32) << 14;
        buf.put_u32_be(packed);
        buf.put_u16_be(self.lteid);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        if buf.len() < HANDSHAKE_EXT_LEN {
            return Err(DecodeError::TooShort {
                what: "handshake extension",
                len: buf.len(),
            });
        }
        let packed = BigEndian::read_u32(&buf[0..4]);
        let lteid = BigEndian::read_u16(&buf[4..6]);
        buf.advance(HANDSHAKE_EXT_LEN);
        Ok(HandshakeExt {
            version: (packed & 0x3fff) as u16,
            handshake_type: ((packed >> 14) & 0x3) as u8,
            lteid,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Data {
        rteid: u16,
        seq: u32,
        payload: Bytes,
    },
    DataAck {
        rteid: u16,
        seq_ack: u32,
        windowsz: u32,
    },
    Keepalive {
        rteid: u16,
    },
    Shutdown {
        rteid: u16,
    },
    HandshakeReq {
        version: u16,
        lteid: u16,
        seq: u32,
        mtu: u32,
        windowsz: u32,
    },
    HandshakeResp {
        rteid: u16,
        version: u16,
        lteid: u16,
        seq: u32,
        seq_ack: u32,
        mtu: u32,
        windowsz: u32,
    },
    HandshakeFin {
        rteid: u16,
        version: u16,
        seq: u32,
        seq_ack: u32,
    },
}

impl Message {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match *self {
            Message::Data {
                rteid,
                seq,
                ref payload,
            } => {
                Header {
                    is_ctrl: false,
                    ctrl_id: 0,
                    rteid,
                }
                .encode(&mut buf);
                buf.put_u32_be(seq);
                buf.put_slice(payload);
            }
            Message::DataAck {
                rteid,
                seq_ack,
                windowsz,
            } => {
                Header {
                    is_ctrl: true,
                    ctrl_id: CTRL_DATA_ACK,
                    rteid,
                }
                .encode(&mut buf);
                buf.put_u32_be(seq_ack);
                buf.put_u32_be(windowsz);
            }
            Message::Keepalive { rteid } => {
                Header {
                    is_ctrl: true,
                    ctrl_id: CTRL_KEEPALIVE,
                    rteid,
                }
                .encode(&mut buf);
            }
            Message::Shutdown { rteid } => {
                Header {
                    is_ctrl: true,
                    ctrl_id: CTRL_SHUTDOWN,
                    rteid,
                }
                .encode(&mut buf);
            }
            Message::HandshakeReq {
                version,
                lteid,
                seq,
                mtu,
                windowsz,
            } => {
                buf.put_u32_be(HANDSHAKE_REQ_MAGIC);
                Header {
                    is_ctrl: true,
                    ctrl_id: CTRL_HANDSHAKE,
                    rteid: 0,
                }
                .encode(&mut buf);
                HandshakeExt {
                    version,
                    handshake_type: HANDSHAKE_REQ,
                    lteid,
                }
                .encode(&mut buf);
                buf.put_u32_be(seq);
                buf.put_u32_be(0); // padding
                buf.put_u32_be(mtu);
                buf.put_u32_be(windowsz);
            }
            Message::HandshakeResp {
                rteid,
                version,
                lteid,
                seq,
                seq_ack,
                mtu,
                windowsz,
            } => {
                Header {
                    is_ctrl: true,
                    ctrl_id: CTRL_HANDSHAKE,
                    rteid,
                }
                .encode(&mut buf);
                HandshakeExt {
                    version,
                    handshake_type: HANDSHAKE_RESP,
                    lteid,
                }
                .encode(&mut buf);
                buf.put_u32_be(seq);
                buf.put_u32_be(seq_ack);
                buf.put_u32_be(mtu);
                buf.put_u32_be(windowsz);
            }
            Message::HandshakeFin {
                rteid,
                version,
                seq,
                seq_ack,
            } => {
                Header {
                    is_ctrl: true,
                    ctrl_id: CTRL_HANDSHAKE,
                    rteid,
                }
                .encode(&mut buf);
                HandshakeExt {
                    version,
                    handshake_type: HANDSHAKE_FIN,
                    lteid: 0,
                }
                .encode(&mut buf);
                buf.put_u32_be(seq);
                buf.put_u32_be(seq_ack);
            }
        }
        buf.freeze()
    }

    /// Decode an inbound datagram. Strips the handshake magic if present,
    /// as receiver dispatch expects.
    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        if buf.len() >= 4 && BigEndian::read_u32(&buf[0..4]) == HANDSHAKE_REQ_MAGIC {
            buf.advance(4);
        }
        let header = Header::decode(&mut buf)?;
        if !header.is_ctrl {
            if buf.len() < 4 {
                return Err(DecodeError::TooShort {
                    what: "data seq",
                    len: buf.len(),
                });
            }
            let seq = BigEndian::read_u32(&buf[0..4]);
            buf.advance(4);
            return Ok(Message::Data {
                rteid: header.rteid,
                seq,
                payload: buf,
            });
        }

        match header.ctrl_id {
            CTRL_DATA_ACK => {
                if buf.len() < 8 {
                    return Err(DecodeError::TooShort {
                        what: "data_ack",
                        len: buf.len(),
                    });
                }
                let seq_ack = BigEndian::read_u32(&buf[0..4]);
                let windowsz = BigEndian::read_u32(&buf[4..8]);
                Ok(Message::DataAck {
                    rteid: header.rteid,
                    seq_ack,
                    windowsz,
                })
            }
            CTRL_KEEPALIVE => Ok(Message::Keepalive {
                rteid: header.rteid,
            }),
            CTRL_SHUTDOWN => Ok(Message::Shutdown {
                rteid: header.rteid,
            }),
            CTRL_HANDSHAKE => {
                let ext = HandshakeExt::decode(&mut buf)?;
                match ext.handshake_type {
                    HANDSHAKE_REQ => {
                        if buf.len() < 16 {
                            return Err(DecodeError::TooShort {
                                what: "handshake_req",
                                len: buf.len(),
                            });
                        }
                        let seq = BigEndian::read_u32(&buf[0..4]);
                        // buf[4..8] is padding, ignored
                        let mtu = BigEndian::read_u32(&buf[8..12]);
                        let windowsz = BigEndian::read_u32(&buf[12..16]);
                        Ok(Message::HandshakeReq {
                            version: ext.version,
                            lteid: ext.lteid,
                            seq,
                            mtu,
                            windowsz,
                        })
                    }
                    HANDSHAKE_RESP => {
                        if buf.len() < 16 {
                            return Err(DecodeError::TooShort {
                                what: "handshake_resp",
                                len: buf.len(),
                            });
                        }
                        let seq = BigEndian::read_u32(&buf[0..4]);
                        let seq_ack = BigEndian::read_u32(&buf[4..8]);
                        let mtu = BigEndian::read_u32(&buf[8..12]);
                        let windowsz = BigEndian::read_u32(&buf[12..16]);
                        Ok(Message::HandshakeResp {
                            rteid: header.rteid,
                            version: ext.version,
                            lteid: ext.lteid,
                            seq,
                            seq_ack,
                            mtu,
                            windowsz,
                        })
                    }
                    HANDSHAKE_FIN => {
                        if buf.len() < 8 {
                            return Err(DecodeError::TooShort {
                                what: "handshake_fin",
                                len: buf.len(),
                            });
                        }
                        let seq = BigEndian::read_u32(&buf[0..4]);
                        let seq_ack = BigEndian::read_u32(&buf[4..8]);
                        Ok(Message::HandshakeFin {
                            rteid: header.rteid,
                            version: ext.version,
                            seq,
                            seq_ack,
                        })
                    }
                    other => Err(DecodeError::UnknownHandshakeType(other)),
                }
            }
            other => Err(DecodeError::UnknownCtrl(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let encoded = msg.encode();
        let decoded = Message::decode(encoded).expect("decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn data_roundtrip() {
        roundtrip(Message::Data {
            rteid: 7,
            seq: 42,
            payload: Bytes::from_static(b"hello"),
        });
    }

    #[test]
    fn data_ack_roundtrip() {
        roundtrip(Message::DataAck {
            rteid: 7,
            seq_ack: 6,
            windowsz: 255,
        });
    }

    #[test]
    fn keepalive_roundtrip() {
        roundtrip(Message::Keepalive { rteid: 3 });
    }

    #[test]
    fn shutdown_roundtrip() {
        roundtrip(Message::Shutdown { rteid: 3 });
    }

    #[test]
    fn handshake_req_roundtrip() {
        roundtrip(Message::HandshakeReq {
            version: 1,
            lteid: 1,
            seq: 0,
            mtu: 1500,
            windowsz: 255,
        });
    }

    #[test]
    fn handshake_resp_roundtrip() {
        roundtrip(Message::HandshakeResp {
            rteid: 1,
            version: 1,
            lteid: 2,
            seq: 0,
            seq_ack: 1,
            mtu: 1500,
            windowsz: 255,
        });
    }

    #[test]
    fn handshake_fin_roundtrip() {
        roundtrip(Message::HandshakeFin {
            rteid: 2,
            version: 1,
            seq: 1,
            seq_ack: 1,
        });
    }

    #[test]
    fn short_buffer_is_rejected() {
        let buf = Bytes::from_static(&[0u8; 2]);
        assert_matches::assert_matches!(Message::decode(buf), Err(DecodeError::TooShort { .. }));
    }

    #[test]
    fn unknown_ctrl_id_is_rejected() {
        let mut buf = BytesMut::new();
        Header {
            is_ctrl: true,
            ctrl_id: 0x7f,
            rteid: 1,
        }
        .encode(&mut buf);
        assert_matches::assert_matches!(
            Message::decode(buf.freeze()),
            Err(DecodeError::UnknownCtrl(0x7f))
        );
    }
}
