#![doc = "Tabsync Harness\n\nIn-process stand-ins for the host collaborators: a scripted mock transport,\na loopback network connecting several contexts, a controllable clock and\nrecording fakes for the notifier, error sink and settings storage."]

pub mod clock;
pub mod fakes;
pub mod network;
pub mod transport;

pub use clock::MockTimeSource;
pub use fakes::{MemorySettingsStorage, RecordingErrorSink, RecordingNotifier};
pub use network::{LoopbackEndpoint, LoopbackNetwork, NetworkStats};
pub use transport::{Delivery, MockTransport};
