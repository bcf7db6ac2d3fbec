//! Mapping of SIP disconnect codes to backend close statuses.

/// Derive the session close status from the final SIP status code of a
/// disconnected call. An explicitly recorded status (for example
/// `transferred`) takes precedence over this mapping.
pub fn close_status_for(last_status_code: u16) -> &'static str {
    match last_status_code {
        603 => "declined",
        486 => "busy",
        487 => "canceled",
        480 | 408 => "noanswer",
        404 => "not_found",
        503 | 504 => "network_error",
        200 => "completed",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map() {
        assert_eq!(close_status_for(603), "declined");
        assert_eq!(close_status_for(486), "busy");
        assert_eq!(close_status_for(487), "canceled");
        assert_eq!(close_status_for(480), "noanswer");
        assert_eq!(close_status_for(408), "noanswer");
        assert_eq!(close_status_for(404), "not_found");
        assert_eq!(close_status_for(503), "network_error");
        assert_eq!(close_status_for(504), "network_error");
        assert_eq!(close_status_for(200), "completed");
    }

    #[test]
    fn everything_else_is_unknown() {
        assert_eq!(close_status_for(500), "unknown");
        assert_eq!(close_status_for(0), "unknown");
    }
}
