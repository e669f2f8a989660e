//! Protocol constants of HID++ the channel core relies on.
//!
//! Record layouts of requests and responses are left to callers. The core only
//! reads fixed-offset bytes, which includes the error codes of error frames.

use crate::message::TransportMessage;

pub mod v10;
pub mod v20;

/// Offset of the error code inside both HID++1.0 and HID++2.0 error frames.
const ERROR_CODE_OFFSET: usize = 5;

/// An error code read out of an error frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ErrorCode {
    V10(v10::ErrorType),
    V20(v20::ErrorType),

    /// The frame is an error frame, but the code is not a known one.
    Unknown(u8),
}

/// Reads the error code of a HID++ error frame.
///
/// Returns `None` if the message is not an error frame.
pub fn error_code(msg: &TransportMessage) -> Option<ErrorCode> {
    if !msg.is_hidpp() {
        return None;
    }

    let code = msg.byte(ERROR_CODE_OFFSET)?;
    match msg.byte(crate::message::offset::SUB_ID)? {
        v10::ERROR_SUB_ID => Some(
            v10::ErrorType::try_from(code).map_or(ErrorCode::Unknown(code), ErrorCode::V10),
        ),
        v20::ERROR_FEATURE_INDEX => Some(
            v20::ErrorType::try_from(code).map_or(ErrorCode::Unknown(code), ErrorCode::V20),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_error_codes() {
        let v10 = TransportMessage::new([0x10, 0xff, 0x8f, 0x81, 0x00, 0x02, 0x00]);
        assert_eq!(error_code(&v10), Some(ErrorCode::V10(v10::ErrorType::InvalidAddress)));

        let mut v20 = vec![0x11, 0x01, 0xff, 0x05, 0x1a, 0x02];
        v20.resize(20, 0);
        assert_eq!(
            error_code(&TransportMessage::new(v20)),
            Some(ErrorCode::V20(v20::ErrorType::InvalidArgument))
        );

        let response = TransportMessage::new([0x10, 0xff, 0x81, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(error_code(&response), None);
    }
}
