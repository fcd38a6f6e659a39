//! RabbitMQ test infrastructure
//!
//! Provides a `TestRabbitMq` helper that runs a RabbitMQ container for testing.

use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::rabbitmq::RabbitMq;

const AMQP_PORT: u16 = 5672;

/// Test RabbitMQ wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRabbitMq;
///
/// # async fn example() {
/// let rabbit = TestRabbitMq::new().await;
///
/// // Point your client at the container
/// let url = rabbit.url();
/// # }
/// ```
pub struct TestRabbitMq {
    #[allow(dead_code)]
    container: ContainerAsync<RabbitMq>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl TestRabbitMq {
    /// Start a RabbitMQ container and wait until it accepts connections.
    ///
    /// The image ships with the `guest`/`guest` account on the default vhost.
    pub async fn new() -> Self {
        let container = RabbitMq::default()
            .start()
            .await
            .expect("Failed to start RabbitMQ container");

        let port = container
            .get_host_port_ipv4(AMQP_PORT)
            .await
            .expect("Failed to get RabbitMQ port");

        tracing::info!(port, "Test RabbitMQ ready");

        Self {
            container,
            host: "127.0.0.1".to_string(),
            port,
            user: "guest".to_string(),
            password: "guest".to_string(),
        }
    }

    /// AMQP URL for the default vhost
    pub fn url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/%2F",
            self.user, self.password, self.host, self.port
        )
    }
}

// Container is automatically cleaned up when TestRabbitMq is dropped
impl Drop for TestRabbitMq {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test RabbitMQ container");
    }
}
