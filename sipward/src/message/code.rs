use std::fmt;

/// An SIP status code.
///
/// Codes the server originates have named variants; anything else a
/// downstream party may send is carried verbatim in [`StatusCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// `Trying` status code.
    Trying,
    /// `Ringing` status code.
    Ringing,
    /// `OK` status code.
    Ok,
    /// `Bad Request` status code.
    BadRequest,
    /// `Unauthorized` status code.
    Unauthorized,
    /// `Forbidden` status code.
    Forbidden,
    /// `Not Found` status code.
    NotFound,
    /// `Method Not Allowed` status code.
    MethodNotAllowed,
    /// `Extension Required` status code.
    ExtensionRequired,
    /// `Call/Transaction Does Not Exist` status code.
    CallOrTransactionDoesNotExist,
    /// `Too Many Hops` status code.
    TooManyHops,
    /// `Busy Here` status code.
    BusyHere,
    /// `Request Terminated` status code.
    RequestTerminated,
    /// `Server Internal Error` status code.
    ServerInternalError,
    /// `Busy Everywhere` status code.
    BusyEverywhere,
    /// Any other status code, carried verbatim.
    Other(u16),
}

impl StatusCode {
    /// Returns the numeric code.
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Trying => 100,
            StatusCode::Ringing => 180,
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::ExtensionRequired => 421,
            StatusCode::CallOrTransactionDoesNotExist => 481,
            StatusCode::TooManyHops => 483,
            StatusCode::BusyHere => 486,
            StatusCode::RequestTerminated => 487,
            StatusCode::ServerInternalError => 500,
            StatusCode::BusyEverywhere => 600,
            StatusCode::Other(code) => *code,
        }
    }

    /// Returns the default reason phrase for this code.
    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Trying => "Trying",
            StatusCode::Ringing => "Ringing",
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::ExtensionRequired => "Extension Required",
            StatusCode::CallOrTransactionDoesNotExist => "Call/Transaction Does Not Exist",
            StatusCode::TooManyHops => "Too Many Hops",
            StatusCode::BusyHere => "Busy Here",
            StatusCode::RequestTerminated => "Request Terminated",
            StatusCode::ServerInternalError => "Server Internal Error",
            StatusCode::BusyEverywhere => "Busy Everywhere",
            StatusCode::Other(_) => "Unknown",
        }
    }

    /// Returns the response class, `floor(code / 100)`.
    pub fn class(&self) -> u16 {
        self.code() / 100
    }

    /// Returns `true` for 1xx responses.
    pub fn is_provisional(&self) -> bool {
        self.class() == 1
    }

    /// Returns `true` for responses with code >= 200.
    pub fn is_final(&self) -> bool {
        self.code() >= 200
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        match code {
            100 => StatusCode::Trying,
            180 => StatusCode::Ringing,
            200 => StatusCode::Ok,
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            403 => StatusCode::Forbidden,
            404 => StatusCode::NotFound,
            405 => StatusCode::MethodNotAllowed,
            421 => StatusCode::ExtensionRequired,
            481 => StatusCode::CallOrTransactionDoesNotExist,
            483 => StatusCode::TooManyHops,
            486 => StatusCode::BusyHere,
            487 => StatusCode::RequestTerminated,
            500 => StatusCode::ServerInternalError,
            600 => StatusCode::BusyEverywhere,
            other => StatusCode::Other(other),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_codes_round_trip() {
        for code in [100u16, 180, 200, 400, 401, 403, 404, 405, 421, 481, 483, 486, 487, 500, 600] {
            assert_eq!(StatusCode::from(code).code(), code);
        }
    }

    #[test]
    fn test_unknown_code_is_carried() {
        let code = StatusCode::from(606u16);
        assert_eq!(code, StatusCode::Other(606));
        assert_eq!(code.class(), 6);
        assert!(code.is_final());
    }
}
