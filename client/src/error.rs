use grpc::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("no address configured for client '{0}'")]
    NoAddress(String),
    #[error("failed to create channel for client '{name}': {source}")]
    Channel {
        name: String,
        #[source]
        source: ChannelError,
    },
}
