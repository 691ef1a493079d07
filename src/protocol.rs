//! Module for building and checking Modbus RTU frames exchanged with the sensor board.

use bytes::BytesMut;
use crc::{Crc, CRC_16_MODBUS};

/// Function code for "read input registers".
pub const READ_INPUT_REGISTERS: u8 = 4;

/// Bit set on the function code of an exception reply.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Trait for protocol frame objects.
pub trait Frame: Sized {
    /// Maximum number of bytes a frame occupies on the wire.
    const LEN: usize;

    /// Check if a full frame is available in the buffer and returns it if possible.
    ///
    /// Frames carry no delimiters, so a frame is complete as soon as `LEN` bytes are buffered.
    /// The frame data is split off the front of the buffer.
    /// If no complete frame is found, the error FrameCheckError::Incomplete is returned.
    fn check(buffer: &mut BytesMut) -> Result<BytesMut, error::FrameCheckError> {
        if buffer.len() < Self::LEN {
            return Err(error::FrameCheckError::Incomplete);
        }
        Ok(buffer.split_to(Self::LEN))
    }

    /// Consumes a buffer and returns the corresponding Frame object.
    ///
    /// The buffer may be shorter than `LEN` if the device stopped sending early.
    fn parse(buffer: BytesMut) -> Result<Self, error::DecodeError>;
}

/// Modbus CRC-16 (reflected polynomial 0xA001, initial value 0xFFFF).
pub const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Exception codes carried in byte 2 of an exception reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    BadCrc,
    BadSlaveAddress,
    BadFunctionCode,
    BadRegisterAddress,
    BadQuantity,
    DataUnavailable,
    Unknown(u8),
}

impl From<u8> for Exception {
    fn from(code: u8) -> Self {
        match code {
            1 => Exception::BadCrc,
            2 => Exception::BadSlaveAddress,
            3 => Exception::BadFunctionCode,
            4 => Exception::BadRegisterAddress,
            5 => Exception::BadQuantity,
            6 => Exception::DataUnavailable,
            other => Exception::Unknown(other),
        }
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exception::BadCrc => write!(f, "bad CRC"),
            Exception::BadSlaveAddress => write!(f, "bad slave address"),
            Exception::BadFunctionCode => write!(f, "bad function code"),
            Exception::BadRegisterAddress => write!(f, "bad register address"),
            Exception::BadQuantity => write!(f, "bad quantity"),
            Exception::DataUnavailable => write!(f, "data unavailable"),
            Exception::Unknown(code) => write!(f, "unknown exception {}", code),
        }
    }
}

pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq)]
    pub enum FrameCheckError {
        #[error("No complete frame in buffer")]
        Incomplete,
    }

    #[derive(Error, Debug, Clone, PartialEq)]
    pub enum DecodeError {
        #[error("Response too short: got {got} bytes, need at least {need}. Input: {input:02x?}")]
        Truncated {
            got: usize,
            need: usize,
            input: Vec<u8>,
        },
    }
}
