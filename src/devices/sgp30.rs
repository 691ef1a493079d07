use crate::{
    error::*,
    output::influx::{LineProtocol, ToLineProtocol},
    output::DataNodeValue,
    protocol::{Exception, EXCEPTION_FLAG, MODBUS_CRC, READ_INPUT_REGISTERS},
    Frame,
};
use bytes::BytesMut;
use std::fmt::{self, Display};

/// Modbus slave address of the sensor board.
pub const SLAVE_ADDRESS: u8 = 5;

/// Baud rate of the device. The sensor board talks 9.6 KBd
pub const BAUD_RATE: u32 = 9600;

/// Registers served by the sensor board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Co2eq,
    Tvoc,
    BaseCo2eq,
    BaseTvoc,
}

const fn request_frame(register: u16) -> [u8; 8] {
    let [reg_hi, reg_lo] = register.to_be_bytes();
    let head = [SLAVE_ADDRESS, READ_INPUT_REGISTERS, reg_hi, reg_lo, 0, 1];
    // the board compares the checksum high byte first
    let [crc_hi, crc_lo] = MODBUS_CRC.checksum(&head).to_be_bytes();
    [head[0], head[1], head[2], head[3], head[4], head[5], crc_hi, crc_lo]
}

static REQUESTS: [[u8; 8]; 4] = [
    request_frame(1),
    request_frame(2),
    request_frame(3),
    request_frame(4),
];

impl Register {
    /// All registers in the order they are polled.
    pub const ALL: [Register; 4] = [
        Register::Co2eq,
        Register::Tvoc,
        Register::BaseCo2eq,
        Register::BaseTvoc,
    ];

    /// Modbus register address.
    pub fn address(self) -> u16 {
        match self {
            Register::Co2eq => 1,
            Register::Tvoc => 2,
            Register::BaseCo2eq => 3,
            Register::BaseTvoc => 4,
        }
    }

    /// Request frame reading this register.
    pub fn request(self) -> &'static [u8; 8] {
        &REQUESTS[self.address() as usize - 1]
    }
}

impl Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Register::Co2eq => "CO2eq",
            Register::Tvoc => "TVOC",
            Register::BaseCo2eq => "Base CO2eq",
            Register::BaseTvoc => "Base TVOC",
        };
        f.write_str(name)
    }
}

/// Response frame received from the sensor board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sgp30Frame {
    /// Function code echoed by the board, or-ed with 0x80 on exception replies.
    pub status: u8,
    /// Byte count of the payload, or the exception code on exception replies.
    pub byte_count: u8,
    /// Big endian register value. Holds the checksum on exception replies.
    pub value: u16,
}

impl Sgp30Frame {
    /// Smallest reply that still carries status and value bytes.
    pub const MIN_LEN: usize = 5;

    /// Decode status and value from a raw reply.
    ///
    /// The reply checksum is not verified, the board only sums the first three bytes.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::MIN_LEN {
            return Err(DecodeError::Truncated {
                got: data.len(),
                need: Self::MIN_LEN,
                input: data.to_vec(),
            });
        }
        Ok(Sgp30Frame {
            status: data[1],
            byte_count: data[2],
            value: u16::from_be_bytes([data[3], data[4]]),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == READ_INPUT_REGISTERS
    }

    /// Exception code, if this is an exception reply.
    pub fn exception(&self) -> Option<Exception> {
        if self.status & EXCEPTION_FLAG != 0 {
            Some(Exception::from(self.byte_count))
        } else {
            None
        }
    }
}

impl Frame for Sgp30Frame {
    const LEN: usize = 10;

    fn parse(buffer: BytesMut) -> Result<Self, DecodeError> {
        Self::decode(&buffer)
    }
}

impl Display for Sgp30Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exception() {
            Some(e) => write!(f, "status {:3}, exception: {}", self.status, e),
            None => write!(f, "status {:3}, value {:5}", self.status, self.value),
        }
    }
}

/// Validated reading of one polling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// CO2 equivalent in ppm
    pub co2eq: u16,
    /// Total volatile organic compounds in ppb
    pub tvoc: u16,
    /// Capture time in milliseconds since the Unix epoch, shared by both values
    pub timestamp: i64,
}

impl Sample {
    /// Data node values as published to IoT-Ticket.
    pub fn to_datanodes(&self) -> Vec<DataNodeValue> {
        vec![
            DataNodeValue::long("CO2eq", "co2eq", "ppm", self.co2eq, self.timestamp),
            DataNodeValue::long("TVOC", "tvoc", "ppb", self.tvoc, self.timestamp),
        ]
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CO2eq {:5} ppm, TVOC {:5} ppb, at {}",
            self.co2eq, self.tvoc, self.timestamp
        )
    }
}

impl ToLineProtocol for Sample {
    fn to_lineprotocol(&self) -> LineProtocol {
        LineProtocol::new("airQuality")
            .add_value("co2eq", self.co2eq as i64)
            .add_value("tvoc", self.tvoc as i64)
            .add_time_millis(self.timestamp)
    }
}

#[cfg(test)]
mod test {
    use crate::output::influx::ToLineProtocol;

    use super::{DecodeError, Frame, Register, Sample, Sgp30Frame};
    use crate::protocol::Exception;
    use bytes::BytesMut;

    #[test]
    fn test_request_table() {
        assert_eq!(Register::Co2eq.request(), &[5, 4, 0, 1, 0, 1, 142, 97]);
        assert_eq!(Register::Tvoc.request(), &[5, 4, 0, 2, 0, 1, 142, 145]);
        assert_eq!(Register::BaseCo2eq.request(), &[5, 4, 0, 3, 0, 1, 78, 192]);
        assert_eq!(Register::BaseTvoc.request(), &[5, 4, 0, 4, 0, 1, 143, 113]);
    }

    #[test]
    fn test_decode_reads_big_endian_value() {
        let frame = Sgp30Frame::decode(&[5, 4, 2, 0x01, 0x2C, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(
            frame,
            Sgp30Frame {
                status: 4,
                byte_count: 2,
                value: 300
            }
        );
        assert!(frame.is_ok());
        assert_eq!(frame.exception(), None);
    }

    #[test]
    fn test_decode_value_for_every_register() {
        for (i, register) in Register::ALL.iter().enumerate() {
            let hi = register.address() as u8;
            let lo = 0x10 * i as u8;
            let frame = Sgp30Frame::decode(&[5, 4, 2, hi, lo, 0, 0]).unwrap();
            assert_eq!((frame.status, frame.value), (4, hi as u16 * 256 + lo as u16));
        }
    }

    #[test]
    fn test_decode_exception_reply() {
        let frame = Sgp30Frame::decode(&[5, 132, 4, 0xAB, 0xCD]).unwrap();
        assert!(!frame.is_ok());
        assert_eq!(frame.exception(), Some(Exception::BadRegisterAddress));
    }

    #[test]
    fn test_decode_detects_truncated_reply() {
        assert_eq!(
            Sgp30Frame::decode(&[5, 4, 2, 1]),
            Err(DecodeError::Truncated {
                got: 4,
                need: 5,
                input: vec![5, 4, 2, 1]
            })
        );
        assert!(Sgp30Frame::parse(BytesMut::new()).is_err());
    }

    #[test]
    fn test_sample_datanodes_share_timestamp() {
        let sample = Sample {
            co2eq: 450,
            tvoc: 20,
            timestamp: 1_676_000_000_000,
        };
        let nodes = sample.to_datanodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "CO2eq");
        assert_eq!(nodes[0].unit, "ppm");
        assert_eq!(nodes[0].v, 450);
        assert_eq!(nodes[1].path, "tvoc");
        assert_eq!(nodes[1].v, 20);
        assert!(nodes.iter().all(|n| n.ts == sample.timestamp));
    }

    #[test]
    fn test_sample_correctly_translated_to_lineprotocol() {
        let sample = Sample {
            co2eq: 450,
            tvoc: 20,
            timestamp: 1_676_000_000_000,
        };
        assert_eq!(
            format!("{}", sample.to_lineprotocol()),
            "airQuality co2eq=450i,tvoc=20i 1676000000000000000"
        );
    }
}
