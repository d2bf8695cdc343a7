pub(crate) use self::transport::Transport;
mod transport;
