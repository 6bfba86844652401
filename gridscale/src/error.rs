//! The errors that can occur while autoscaling a grid engine cluster

/// An error from gridscale
#[derive(Debug)]
pub enum Error {
    /// A generic error with a message
    Generic(String),
    /// A batch engine or shell command failed
    Execution {
        /// The command that was executed
        cmd: String,
        /// The exit code of this command if it exited at all
        code: Option<i32>,
        /// Anything this command wrote to stderr
        stderr: String,
    },
    /// A launch or removal step failed after exhausting its retries
    Scaling(String),
    /// The config prevents the autoscaler from starting at all
    Validation(String),
    /// An error returned by the cloud api
    Api {
        /// The status code that was returned
        code: u16,
        /// The error message that was returned
        msg: Option<String>,
    },
    /// An error from sending or recieving a request
    #[cfg(feature = "client")]
    Reqwest(reqwest::Error),
    /// An error from joining a tokio task
    #[cfg(feature = "client")]
    JoinError(tokio::task::JoinError),
    /// An IO Error
    IO(std::io::Error),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from parsing an int
    ParseInt(std::num::ParseIntError),
    /// An error from parsing a float
    ParseFloat(std::num::ParseFloatError),
    /// An error from parsing a timestamp/date
    ChronoParse(chrono::ParseError),
    /// An error from using a regex
    Regex(regex::Error),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Create a new execution error
    ///
    /// # Arguments
    ///
    /// * `cmd` - The command that failed
    /// * `code` - The exit code of the failed command
    /// * `stderr` - What the failed command wrote to stderr
    pub fn execution<C: Into<String>, S: Into<String>>(cmd: C, code: Option<i32>, stderr: S) -> Self {
        Error::Execution {
            cmd: cmd.into(),
            code,
            stderr: stderr.into(),
        }
    }

    /// Create a new scaling error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn scaling<T: Into<String>>(msg: T) -> Self {
        Error::Scaling(msg.into())
    }

    /// Create a new validation error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Build an api error from a failed response
    ///
    /// # Arguments
    ///
    /// * `resp` - The response that had an error status
    #[cfg(feature = "client")]
    pub async fn from_response(resp: reqwest::Response) -> Self {
        Error::Api {
            code: resp.status().as_u16(),
            msg: resp.text().await.ok().filter(|msg| !msg.is_empty()),
        }
    }

    /// Get the error message for this error if one exists
    #[must_use]
    pub fn msg(&self) -> Option<String> {
        match self {
            Error::Generic(msg) | Error::Scaling(msg) | Error::Validation(msg) => Some(msg.clone()),
            Error::Execution { cmd, code, stderr } => match code {
                Some(code) => Some(format!("`{cmd}` exited with {code}: {}", stderr.trim())),
                None => Some(format!("`{cmd}` was terminated: {}", stderr.trim())),
            },
            Error::Api { msg, .. } => msg.clone(),
            #[cfg(feature = "client")]
            Error::Reqwest(err) => Some(err.to_string()),
            #[cfg(feature = "client")]
            Error::JoinError(err) => Some(err.to_string()),
            Error::IO(err) => Some(err.to_string()),
            Error::Config(err) => Some(err.to_string()),
            Error::Serde(err) => Some(err.to_string()),
            Error::ParseInt(err) => Some(err.to_string()),
            Error::ParseFloat(err) => Some(err.to_string()),
            Error::ChronoParse(err) => Some(err.to_string()),
            Error::Regex(err) => Some(err.to_string()),
        }
    }

    /// get the kind of error as a str
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Generic(_) => "Generic",
            Error::Execution { .. } => "Execution",
            Error::Scaling(_) => "Scaling",
            Error::Validation(_) => "Validation",
            Error::Api { .. } => "Api",
            #[cfg(feature = "client")]
            Error::Reqwest(_) => "Reqwest",
            #[cfg(feature = "client")]
            Error::JoinError(_) => "JoinError",
            Error::IO(_) => "IO",
            Error::Config(_) => "Config",
            Error::Serde(_) => "Serde",
            Error::ParseInt(_) => "ParseInt",
            Error::ParseFloat(_) => "ParseFloat",
            Error::ChronoParse(_) => "ChronoParse",
            Error::Regex(_) => "Regex",
        }
    }
}

impl std::fmt::Display for Error {
    /// display this error in a easy readble format
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match (self, self.msg()) {
            (Error::Api { code, .. }, Some(msg)) => write!(f, "Code: {code} Error: {msg}"),
            (Error::Api { code, .. }, None) => write!(f, "Code: {code}"),
            (_, Some(msg)) => write!(f, "{} Error: {msg}", self.kind()),
            (_, None) => write!(f, "Kind: {}", self.kind()),
        }
    }
}

// mark that this is an error struct
impl std::error::Error for Error {}

#[cfg(feature = "client")]
impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Reqwest(error)
    }
}

#[cfg(feature = "client")]
impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::JoinError(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error::ParseInt(error)
    }
}

impl From<std::num::ParseFloatError> for Error {
    fn from(error: std::num::ParseFloatError) -> Self {
        Error::ParseFloat(error)
    }
}

impl From<chrono::ParseError> for Error {
    fn from(error: chrono::ParseError) -> Self {
        Error::ChronoParse(error)
    }
}

impl From<regex::Error> for Error {
    fn from(error: regex::Error) -> Self {
        Error::Regex(error)
    }
}
