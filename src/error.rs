use std::fmt::Display;

#[derive(Debug)]
pub enum RuffleError {
    Input(String),
    Config(String),
    Topology(String),
    Solver(String),
    PostProcessor(String),
}

impl Display for RuffleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (err_name, value) = match self {
            RuffleError::Input(v) => ("Input", v),
            RuffleError::Config(v) => ("Config", v),
            RuffleError::Topology(v) => ("Topology", v),
            RuffleError::Solver(v) => ("Solver", v),
            RuffleError::PostProcessor(v) => ("Post Processor", v),
        };

        write!(f, "{} error: {}", err_name, value)
    }
}

impl std::error::Error for RuffleError {}

impl From<argmin::core::Error> for RuffleError {
    fn from(err: argmin::core::Error) -> Self {
        RuffleError::Solver(err.to_string())
    }
}
