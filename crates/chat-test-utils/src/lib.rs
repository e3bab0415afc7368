// chat-test-utils: shared test helpers for the fanout hub.
//
// Provides a mock WebSocket client for integration tests of the hub's
// session and fan-out behavior.

pub mod mock_ws_client;

pub use mock_ws_client::MockWsClient;
