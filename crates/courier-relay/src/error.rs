use courier_carrier::CarrierError;

/// Errors on the relay surface.
///
/// Protocol violations terminate only the offending client; carrier
/// errors are reported back over the wire where a frame allows it.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("field too large: {size} bytes (max {max})")]
    FieldTooLarge { size: usize, max: usize },

    #[error("relay closed")]
    Closed,

    #[error("carrier error: {0}")]
    Carrier(#[from] CarrierError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_unknown_opcode() {
        assert_eq!(RelayError::UnknownOpcode(0xff).to_string(), "unknown opcode 0xff");
    }

    #[test]
    fn carrier_error_converts() {
        let err: RelayError = CarrierError::Timeout.into();
        assert!(matches!(err, RelayError::Carrier(CarrierError::Timeout)));
    }
}
