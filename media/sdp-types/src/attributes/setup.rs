use std::fmt;

/// DTLS setup role (`a=setup`)
///
/// [RFC4145](https://datatracker.ietf.org/doc/html/rfc4145#section-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setup {
    Active,
    Passive,
    ActPass,
    HoldConn,
}

impl Setup {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "active" => Some(Setup::Active),
            "passive" => Some(Setup::Passive),
            "actpass" => Some(Setup::ActPass),
            "holdconn" => Some(Setup::HoldConn),
            _ => None,
        }
    }

    /// Role the answerer takes in response to an offered role
    pub fn answer(self) -> Self {
        match self {
            Setup::ActPass | Setup::Passive => Setup::Active,
            Setup::Active => Setup::Passive,
            Setup::HoldConn => Setup::HoldConn,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Setup::Active => "active",
            Setup::Passive => "passive",
            Setup::ActPass => "actpass",
            Setup::HoldConn => "holdconn",
        }
    }
}

impl fmt::Display for Setup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn answer_role() {
        assert_eq!(Setup::parse("actpass"), Some(Setup::ActPass));
        assert_eq!(Setup::ActPass.answer(), Setup::Active);
        assert_eq!(Setup::Active.answer(), Setup::Passive);
        assert_eq!(Setup::parse("sideways"), None);
    }
}
