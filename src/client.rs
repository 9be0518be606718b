// Remote counterpart of the host: publishes action payloads, keeps the
// newest observation. Thin by design; everything interesting happens on
// the robot side of the wire.

use tracing::{debug, warn};

use crate::config::{TOPIC_ACTION, TOPIC_OBSERVATION};
use crate::messages::{ActionPayload, Observation};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct RobotClient {
    _session: zenoh::Session,
    action_pub: zenoh::pubsub::Publisher<'static>,
    observation_sub: zenoh::pubsub::Subscriber<
        zenoh::handlers::FifoChannelHandler<zenoh::sample::Sample>,
    >,
    latest: Option<Observation>,
}

impl RobotClient {
    pub async fn connect() -> Result<Self, BoxError> {
        let session = zenoh::open(zenoh::Config::default()).await?;
        let action_pub = session.declare_publisher(TOPIC_ACTION).await?;
        let observation_sub = session.declare_subscriber(TOPIC_OBSERVATION).await?;
        Ok(Self {
            _session: session,
            action_pub,
            observation_sub,
            latest: None,
        })
    }

    pub async fn send_action(&self, action: &ActionPayload) -> Result<(), BoxError> {
        let json = action.to_wire().to_string();
        debug!("sending action: {}", json);
        self.action_pub.put(json).await?;
        Ok(())
    }

    /// Newest observation received so far, if any. Drains the queue so a
    /// slow caller sees current state, not a backlog.
    pub fn latest_observation(&mut self) -> Option<&Observation> {
        while let Ok(Some(sample)) = self.observation_sub.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<Observation>(&payload) {
                Ok(obs) => self.latest = Some(obs),
                Err(e) => warn!("unparseable observation: {}", e),
            }
        }
        self.latest.as_ref()
    }
}
