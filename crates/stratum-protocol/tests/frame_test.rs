// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Framed conversations over an in-memory stream.

use bytes::Bytes;
use stratum_protocol::frame::{Frame, FrameError, FramedStream, MessageType};
use stratum_protocol::{
    CloseMessageSubscription, LogBlock, LogBlockEntry, LogBlockRequest, OpenMessageSubscription,
    ReplicationRequest, SubscriptionAddress, SubscriptionCommand, WireMessage,
};
use tokio::io::duplex;

fn address() -> SubscriptionAddress {
    SubscriptionAddress {
        subscription_partition_id: 3,
        workflow_instance_partition_id: 1,
        workflow_instance_key: 100,
        activity_instance_key: 101,
    }
}

#[tokio::test]
async fn test_subscription_frames_arrive_in_order() {
    let (writer, reader) = duplex(4096);
    let mut writer = FramedStream::new(writer);
    let mut reader = FramedStream::new(reader);

    let open = SubscriptionCommand::OpenMessageSubscription(OpenMessageSubscription {
        address: address(),
        message_name: "payment".to_string(),
        correlation_key: "order-7".to_string(),
    });
    let close = SubscriptionCommand::CloseMessageSubscription(CloseMessageSubscription {
        address: address(),
        message_name: "payment".to_string(),
    });

    writer.send_subscription(open.to_bytes().unwrap()).await.unwrap();
    writer.send_subscription(close.to_bytes().unwrap()).await.unwrap();
    drop(writer);

    let first = reader.read_frame().await.unwrap();
    let second = reader.read_frame().await.unwrap();
    assert_eq!(first.message_type, MessageType::Subscription);
    assert_eq!(SubscriptionCommand::from_bytes(&first.payload).unwrap(), open);
    assert_eq!(SubscriptionCommand::from_bytes(&second.payload).unwrap(), close);

    assert!(matches!(
        reader.read_frame().await,
        Err(FrameError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_request_response_conversation() {
    let (client, server) = duplex(64 * 1024);
    let mut client = FramedStream::new(client);
    let mut server = FramedStream::new(server);

    let serve = tokio::spawn(async move {
        let frame = server.read_frame().await.unwrap();
        assert_eq!(frame.message_type, MessageType::Request);
        let request = ReplicationRequest::decode(&mut frame.payload.clone()).unwrap();
        let ReplicationRequest::LogBlock(request) = request else {
            panic!("expected a log block request");
        };
        let entries: Vec<LogBlockEntry> = (request.from_position..request.from_position + 3)
            .map(|position| LogBlockEntry {
                position,
                data: Bytes::from(format!("entry-{position}")),
            })
            .collect();
        server
            .respond(&LogBlock::from_entries(10, &entries))
            .await
            .unwrap();
    });

    let block: LogBlock = client
        .request(&LogBlockRequest {
            partition_id: 1,
            from_position: 4,
            max_entries: 3,
        })
        .await
        .unwrap();
    serve.await.unwrap();

    let entries = block.entries().unwrap();
    assert_eq!(block.commit_position, 10);
    let positions: Vec<u64> = entries.iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![4, 5, 6]);
    assert_eq!(&entries[2].data[..], b"entry-6");
}

#[tokio::test]
async fn test_request_rejects_subscription_reply() {
    let (client, server) = duplex(4096);
    let mut client = FramedStream::new(client);
    let mut server = FramedStream::new(server);

    let serve = tokio::spawn(async move {
        let _ = server.read_frame().await.unwrap();
        server
            .send_subscription(Bytes::from_static(b"noise"))
            .await
            .unwrap();
    });

    let result: Result<LogBlock, _> = client
        .request(&LogBlockRequest {
            partition_id: 1,
            from_position: 1,
            max_entries: 1,
        })
        .await;
    serve.await.unwrap();
    assert!(matches!(
        result,
        Err(FrameError::UnexpectedMessageType(MessageType::Subscription))
    ));
}

#[test]
fn test_frame_payload_is_the_encoded_message() {
    let request = LogBlockRequest {
        partition_id: 1,
        from_position: 2,
        max_entries: 8,
    };
    let frame = Frame::request(&request).unwrap();
    assert_eq!(frame.payload, request.to_bytes().unwrap());
}
