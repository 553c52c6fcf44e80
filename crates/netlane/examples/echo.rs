//! Loopback echo: a client sends numbered messages over a reliable
//! channel, the server echoes them back, both driven over the in-memory
//! network with simulated latency and loss.

use std::rc::Rc;

use netlane::prelude::*;
use netlane::{read_int_range, write_int_range, BitReader, StreamError, WireWrite};

const PROTOCOL_ID: u64 = 0x11223344_55667788;
const NUM_MESSAGES: u32 = 64;

#[derive(Default)]
struct EchoMessage {
    sequence: u32,
}

impl Message for EchoMessage {
    fn write(&self, writer: &mut dyn WireWrite) -> Result<(), StreamError> {
        write_int_range(writer, self.sequence, 0, 100_000)
    }

    fn read(&mut self, reader: &mut BitReader<'_>) -> Result<(), StreamError> {
        self.sequence = read_int_range(reader, 0, 100_000)?;
        Ok(())
    }
}

struct EchoMessageFactory;

impl MessageFactory for EchoMessageFactory {
    fn num_types(&self) -> usize {
        1
    }

    fn create(&self, kind: u8) -> Option<NetMessage> {
        (kind == 0).then(|| NetMessage::new(0, Box::new(EchoMessage::default())))
    }
}

fn main() {
    let factory: Rc<dyn MessageFactory> = Rc::new(EchoMessageFactory);
    let config = ClientServerConfig::default();
    let network = MemoryNetwork::new(PROTOCOL_ID);

    let mut server =
        Server::new(config.clone(), factory.clone(), Box::new(network.server_transport()), 0.0);
    server.start(1).expect("server start");
    server.set_latency(50.0);
    server.set_packet_loss(10.0);

    let mut client =
        Client::new(config, factory.clone(), Box::new(network.client_transport(0)), 0.0)
            .expect("client create");
    client.set_latency(50.0);
    client.set_packet_loss(10.0);

    let address = "127.0.0.1:40000".parse().expect("address");
    client.connect(&ConnectToken::new(address, 1, PROTOCOL_ID));

    for sequence in 0..NUM_MESSAGES {
        let message = factory.create_message(0).expect("create message");
        message.borrow_mut().downcast_mut::<EchoMessage>().expect("downcast").sequence = sequence;
        client.send_message(0, message);
    }

    let mut time = 0.0;
    let mut echoed = 0;
    while echoed < NUM_MESSAGES {
        time += 0.02;

        client.receive_packets();
        client.advance_time(time);

        server.receive_packets();
        server.advance_time(time);

        // Server: echo everything straight back.
        while let Some(message) = server.receive_message(0, 0) {
            let sequence =
                message.borrow().downcast_ref::<EchoMessage>().expect("downcast").sequence;
            let echo = factory.create_message(0).expect("create message");
            echo.borrow_mut().downcast_mut::<EchoMessage>().expect("downcast").sequence = sequence;
            server.send_message(0, 0, echo);
        }

        // Client: count the echoes, which arrive in order.
        while let Some(message) = client.receive_message(0) {
            let sequence =
                message.borrow().downcast_ref::<EchoMessage>().expect("downcast").sequence;
            assert_eq!(sequence, echoed);
            echoed += 1;
        }

        client.send_packets();
        server.send_packets();
    }

    let info = client.network_info();
    println!(
        "echoed {} messages in {:.2}s simulated (rtt {:.0}ms, sent {}, acked {})",
        echoed,
        time,
        info.rtt * 1000.0,
        info.num_packets_sent,
        info.num_packets_acked
    );

    client.disconnect();
    server.stop();
}
