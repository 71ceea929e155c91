use failure::Fail;

#[derive(Debug, Fail)]
pub enum BackendError {
    #[fail(display = "request failed: {}", _0)]
    Transport(#[cause] reqwest::Error),
    #[fail(display = "unexpected status {}", _0)]
    Status(u16),
    #[fail(display = "malformed response: {}", _0)]
    Malformed(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Transport(err)
    }
}

#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "{} is not valid: {:?} ({})", name, value, reason)]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[fail(display = "plate layout {:?} is not usable: {}", layout, reason)]
    Layout { layout: String, reason: String },
}

impl ConfigError {
    pub fn invalid(name: &'static str, value: &str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}
