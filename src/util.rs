use std::io::ErrorKind;

use rand::Rng;
use rand::distr::Alphanumeric;

/// True for errors that only mean the peer or the connection went away.
pub fn is_closed_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::TimedOut
    )
}

pub fn connection_error(error: quinn::ConnectionError) -> std::io::Error {
    use quinn::ConnectionError::*;
    let kind = match &error {
        TimedOut => ErrorKind::TimedOut,
        Reset => ErrorKind::ConnectionReset,
        LocallyClosed | ApplicationClosed(_) | ConnectionClosed(_) => ErrorKind::ConnectionAborted,
        _ => ErrorKind::Other,
    };
    std::io::Error::new(kind, error)
}

/// Random printable padding of a length in `min..max`.
pub fn random_padding(min: usize, max: usize) -> String {
    let mut rng = rand::rng();
    let len = rng.random_range(min..max);
    (&mut rng)
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
