//! Client/server host tests over the in-memory loopback network.

use std::rc::Rc;

use netlane_core::config::ClientServerConfig;
use netlane_host::{Client, ConnectToken, MemoryNetwork, Server};
use netlane_protocol::{Message, MessageFactory, MessageRef, NetMessage};
use netlane_stream::{BitReader, StreamError, WireWrite};

const PROTOCOL_ID: u64 = 0x1122_3344;

#[derive(Default)]
struct TestMessage {
    counter: u32,
}

impl Message for TestMessage {
    fn write(&self, writer: &mut dyn WireWrite) -> Result<(), StreamError> {
        writer.write_bits(self.counter, 32)
    }

    fn read(&mut self, reader: &mut BitReader<'_>) -> Result<(), StreamError> {
        self.counter = reader.read_bits(32)?;
        Ok(())
    }
}

struct TestMessageFactory;

impl MessageFactory for TestMessageFactory {
    fn num_types(&self) -> usize {
        1
    }

    fn create(&self, kind: u8) -> Option<NetMessage> {
        (kind == 0).then(|| NetMessage::new(0, Box::new(TestMessage::default())))
    }
}

fn test_message(counter: u32) -> MessageRef {
    let message = TestMessageFactory.create_message(0).unwrap();
    message.borrow_mut().downcast_mut::<TestMessage>().unwrap().counter = counter;
    message
}

fn token(client_id: u64) -> ConnectToken {
    ConnectToken::new("127.0.0.1:40000".parse().unwrap(), client_id, PROTOCOL_ID)
}

fn setup(max_clients: usize) -> (Server, Vec<Client>) {
    let factory: Rc<dyn MessageFactory> = Rc::new(TestMessageFactory);
    let mut config = ClientServerConfig::default();
    config.protocol_id = PROTOCOL_ID;
    config.network_simulator = false;

    let network = MemoryNetwork::new(PROTOCOL_ID);
    let mut server =
        Server::new(config.clone(), factory.clone(), Box::new(network.server_transport()), 0.0);
    server.start(max_clients).unwrap();

    let clients = (0..max_clients)
        .map(|client_index| {
            Client::new(
                config.clone(),
                factory.clone(),
                Box::new(network.client_transport(client_index)),
                0.0,
            )
            .unwrap()
        })
        .collect();

    (server, clients)
}

fn step(time: f64, server: &mut Server, clients: &mut [Client]) {
    for client in clients.iter_mut() {
        client.receive_packets();
        client.advance_time(time);
    }
    server.receive_packets();
    server.advance_time(time);
    for client in clients.iter_mut() {
        client.send_packets();
    }
    server.send_packets();
}

#[test]
fn client_connects_and_messages_flow_both_ways() {
    let (mut server, mut clients) = setup(1);
    let client = &mut clients[0];
    client.connect(&token(1));
    assert!(client.is_connected());
    assert_eq!(client.client_index(), Some(0));
    assert!(server.is_client_connected(0));

    const NUM_MESSAGES: u32 = 100;
    for counter in 0..NUM_MESSAGES {
        clients[0].send_message(0, test_message(counter));
        server.send_message(0, 0, test_message(1000 + counter));
    }

    let mut client_received = 0u32;
    let mut server_received = 0u32;
    let mut time = 0.0;
    while client_received < NUM_MESSAGES || server_received < NUM_MESSAGES {
        time += 0.05;
        step(time, &mut server, &mut clients);

        while let Some(message) = server.receive_message(0, 0) {
            let counter = message.borrow().downcast_ref::<TestMessage>().unwrap().counter;
            assert_eq!(counter, server_received);
            server_received += 1;
        }
        while let Some(message) = clients[0].receive_message(0) {
            let counter = message.borrow().downcast_ref::<TestMessage>().unwrap().counter;
            assert_eq!(counter, 1000 + client_received);
            client_received += 1;
        }
        assert!(time < 30.0, "exchange failed to finish");
    }

    let info = clients[0].network_info();
    assert!(info.num_packets_sent > 0);
    assert!(info.num_packets_acked > 0);
}

#[test]
fn multiple_clients_have_independent_streams() {
    let (mut server, mut clients) = setup(3);
    for (client_index, client) in clients.iter_mut().enumerate() {
        client.connect(&token(client_index as u64 + 1));
        assert!(client.is_connected());
    }

    for (client_index, client) in clients.iter_mut().enumerate() {
        for counter in 0..10u32 {
            client.send_message(0, test_message(client_index as u32 * 100 + counter));
        }
    }

    let mut time = 0.0;
    let mut received = [0u32; 3];
    while received.iter().any(|&count| count < 10) {
        time += 0.05;
        step(time, &mut server, &mut clients);
        for client_index in 0..3 {
            while let Some(message) = server.receive_message(client_index, 0) {
                let counter = message.borrow().downcast_ref::<TestMessage>().unwrap().counter;
                assert_eq!(counter, client_index as u32 * 100 + received[client_index]);
                received[client_index] += 1;
            }
        }
        assert!(time < 30.0);
    }
}

#[test]
fn kicked_client_observes_disconnect() {
    let (mut server, mut clients) = setup(1);
    clients[0].connect(&token(1));
    assert!(clients[0].is_connected());

    server.disconnect_client(0).unwrap();
    assert!(!server.is_client_connected(0));

    let mut time = 0.0;
    for _ in 0..3 {
        time += 0.05;
        step(time, &mut server, &mut clients);
    }
    assert!(!clients[0].is_connected());
}

#[test]
fn stopping_the_server_drops_everyone() {
    let (mut server, mut clients) = setup(2);
    clients[0].connect(&token(1));
    clients[1].connect(&token(2));

    server.stop();
    assert!(!server.is_running());

    let mut time = 0.0;
    for _ in 0..3 {
        time += 0.05;
        step(time, &mut server, &mut clients);
    }
    assert!(!clients[0].is_connected());
    assert!(!clients[1].is_connected());
}
