// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-partition subscription messages.
//!
//! A message catch event on the workflow instance partition opens a
//! subscription on the partition that owns the message's correlation key.
//! The two partitions then exchange these messages until the subscription
//! is correlated or closed. Every message shares the same fixed block:
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 2    | subscription partition id      |
//! | 2      | 2    | workflow instance partition id |
//! | 4      | 8    | workflow instance key          |
//! | 12     | 8    | activity instance key          |
//!
//! Variable-length fields follow in the order they are declared on each
//! message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{
    DecodeError, EncodeError, MessageHeader, WireMessage, get_var_bytes, get_var_string,
    put_var_bytes, put_var_string, var_bytes_length, var_string_length,
};

/// Fixed block length shared by every subscription message.
pub const SUBSCRIPTION_BLOCK_LENGTH: u16 = 20;

/// Addressing fields at the start of every subscription message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionAddress {
    pub subscription_partition_id: u16,
    pub workflow_instance_partition_id: u16,
    pub workflow_instance_key: i64,
    pub activity_instance_key: i64,
}

impl SubscriptionAddress {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.subscription_partition_id);
        buf.put_u16_le(self.workflow_instance_partition_id);
        buf.put_i64_le(self.workflow_instance_key);
        buf.put_i64_le(self.activity_instance_key);
    }

    fn decode(block: &mut Bytes) -> Self {
        Self {
            subscription_partition_id: block.get_u16_le(),
            workflow_instance_partition_id: block.get_u16_le(),
            workflow_instance_key: block.get_i64_le(),
            activity_instance_key: block.get_i64_le(),
        }
    }
}

/// Sent to the subscription partition to open a message subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessageSubscription {
    pub address: SubscriptionAddress,
    pub message_name: String,
    pub correlation_key: String,
}

impl WireMessage for OpenMessageSubscription {
    const TEMPLATE_ID: u16 = 0;
    const BLOCK_LENGTH: u16 = SUBSCRIPTION_BLOCK_LENGTH;

    fn var_length(&self) -> usize {
        var_string_length(&self.message_name) + var_string_length(&self.correlation_key)
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        self.address.encode(buf);
    }

    fn encode_var(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_var_string(buf, "messageName", &self.message_name)?;
        put_var_string(buf, "correlationKey", &self.correlation_key)
    }

    fn decode_parts(block: &mut Bytes, tail: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            address: SubscriptionAddress::decode(block),
            message_name: get_var_string(tail, "messageName")?,
            correlation_key: get_var_string(tail, "correlationKey")?,
        })
    }
}

/// Sent back to the workflow instance partition once the subscription is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenWorkflowInstanceSubscription {
    pub address: SubscriptionAddress,
    pub message_name: String,
}

impl WireMessage for OpenWorkflowInstanceSubscription {
    const TEMPLATE_ID: u16 = 1;
    const BLOCK_LENGTH: u16 = SUBSCRIPTION_BLOCK_LENGTH;

    fn var_length(&self) -> usize {
        var_string_length(&self.message_name)
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        self.address.encode(buf);
    }

    fn encode_var(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_var_string(buf, "messageName", &self.message_name)
    }

    fn decode_parts(block: &mut Bytes, tail: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            address: SubscriptionAddress::decode(block),
            message_name: get_var_string(tail, "messageName")?,
        })
    }
}

/// Carries a correlated message's payload to the workflow instance partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelateWorkflowInstanceSubscription {
    pub address: SubscriptionAddress,
    pub message_name: String,
    pub payload: Bytes,
}

impl WireMessage for CorrelateWorkflowInstanceSubscription {
    const TEMPLATE_ID: u16 = 2;
    const BLOCK_LENGTH: u16 = SUBSCRIPTION_BLOCK_LENGTH;

    fn var_length(&self) -> usize {
        var_string_length(&self.message_name) + var_bytes_length(&self.payload)
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        self.address.encode(buf);
    }

    fn encode_var(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_var_string(buf, "messageName", &self.message_name)?;
        put_var_bytes(buf, &self.payload);
        Ok(())
    }

    fn decode_parts(block: &mut Bytes, tail: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            address: SubscriptionAddress::decode(block),
            message_name: get_var_string(tail, "messageName")?,
            payload: get_var_bytes(tail)?,
        })
    }
}

/// Acknowledges a correlation back to the subscription partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelateMessageSubscription {
    pub address: SubscriptionAddress,
    pub message_name: String,
}

impl WireMessage for CorrelateMessageSubscription {
    const TEMPLATE_ID: u16 = 3;
    const BLOCK_LENGTH: u16 = SUBSCRIPTION_BLOCK_LENGTH;

    fn var_length(&self) -> usize {
        var_string_length(&self.message_name)
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        self.address.encode(buf);
    }

    fn encode_var(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_var_string(buf, "messageName", &self.message_name)
    }

    fn decode_parts(block: &mut Bytes, tail: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            address: SubscriptionAddress::decode(block),
            message_name: get_var_string(tail, "messageName")?,
        })
    }
}

/// Closes a message subscription when its element instance terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseMessageSubscription {
    pub address: SubscriptionAddress,
    pub message_name: String,
}

impl WireMessage for CloseMessageSubscription {
    const TEMPLATE_ID: u16 = 4;
    const BLOCK_LENGTH: u16 = SUBSCRIPTION_BLOCK_LENGTH;

    fn var_length(&self) -> usize {
        var_string_length(&self.message_name)
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        self.address.encode(buf);
    }

    fn encode_var(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_var_string(buf, "messageName", &self.message_name)
    }

    fn decode_parts(block: &mut Bytes, tail: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            address: SubscriptionAddress::decode(block),
            message_name: get_var_string(tail, "messageName")?,
        })
    }
}

/// Any subscription message, dispatched by template id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionCommand {
    OpenMessageSubscription(OpenMessageSubscription),
    OpenWorkflowInstanceSubscription(OpenWorkflowInstanceSubscription),
    CorrelateWorkflowInstanceSubscription(CorrelateWorkflowInstanceSubscription),
    CorrelateMessageSubscription(CorrelateMessageSubscription),
    CloseMessageSubscription(CloseMessageSubscription),
}

impl SubscriptionCommand {
    /// Decode one message, whatever its template.
    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let header = MessageHeader::peek(buf)?;
        Ok(match header.template_id {
            OpenMessageSubscription::TEMPLATE_ID => {
                Self::OpenMessageSubscription(OpenMessageSubscription::decode(buf)?)
            }
            OpenWorkflowInstanceSubscription::TEMPLATE_ID => Self::OpenWorkflowInstanceSubscription(
                OpenWorkflowInstanceSubscription::decode(buf)?,
            ),
            CorrelateWorkflowInstanceSubscription::TEMPLATE_ID => {
                Self::CorrelateWorkflowInstanceSubscription(
                    CorrelateWorkflowInstanceSubscription::decode(buf)?,
                )
            }
            CorrelateMessageSubscription::TEMPLATE_ID => {
                Self::CorrelateMessageSubscription(CorrelateMessageSubscription::decode(buf)?)
            }
            CloseMessageSubscription::TEMPLATE_ID => {
                Self::CloseMessageSubscription(CloseMessageSubscription::decode(buf)?)
            }
            other => return Err(DecodeError::UnknownTemplate(other)),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(&mut Bytes::copy_from_slice(bytes))
    }

    pub fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        match self {
            Self::OpenMessageSubscription(m) => m.to_bytes(),
            Self::OpenWorkflowInstanceSubscription(m) => m.to_bytes(),
            Self::CorrelateWorkflowInstanceSubscription(m) => m.to_bytes(),
            Self::CorrelateMessageSubscription(m) => m.to_bytes(),
            Self::CloseMessageSubscription(m) => m.to_bytes(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::OpenMessageSubscription(m) => m.encoded_len(),
            Self::OpenWorkflowInstanceSubscription(m) => m.encoded_len(),
            Self::CorrelateWorkflowInstanceSubscription(m) => m.encoded_len(),
            Self::CorrelateMessageSubscription(m) => m.encoded_len(),
            Self::CloseMessageSubscription(m) => m.encoded_len(),
        }
    }

    pub fn address(&self) -> &SubscriptionAddress {
        match self {
            Self::OpenMessageSubscription(m) => &m.address,
            Self::OpenWorkflowInstanceSubscription(m) => &m.address,
            Self::CorrelateWorkflowInstanceSubscription(m) => &m.address,
            Self::CorrelateMessageSubscription(m) => &m.address,
            Self::CloseMessageSubscription(m) => &m.address,
        }
    }

    pub fn address_mut(&mut self) -> &mut SubscriptionAddress {
        match self {
            Self::OpenMessageSubscription(m) => &mut m.address,
            Self::OpenWorkflowInstanceSubscription(m) => &mut m.address,
            Self::CorrelateWorkflowInstanceSubscription(m) => &mut m.address,
            Self::CorrelateMessageSubscription(m) => &mut m.address,
            Self::CloseMessageSubscription(m) => &mut m.address,
        }
    }

    pub fn message_name(&self) -> &str {
        match self {
            Self::OpenMessageSubscription(m) => &m.message_name,
            Self::OpenWorkflowInstanceSubscription(m) => &m.message_name,
            Self::CorrelateWorkflowInstanceSubscription(m) => &m.message_name,
            Self::CorrelateMessageSubscription(m) => &m.message_name,
            Self::CloseMessageSubscription(m) => &m.message_name,
        }
    }

    /// Partition that must handle this message.
    ///
    /// Messages addressed to the subscription side route by the subscription
    /// partition id, replies to the workflow instance side route by the
    /// workflow instance partition id.
    pub fn target_partition_id(&self) -> u16 {
        let address = self.address();
        match self {
            Self::OpenMessageSubscription(_)
            | Self::CorrelateMessageSubscription(_)
            | Self::CloseMessageSubscription(_) => address.subscription_partition_id,
            Self::OpenWorkflowInstanceSubscription(_)
            | Self::CorrelateWorkflowInstanceSubscription(_) => {
                address.workflow_instance_partition_id
            }
        }
    }

    pub fn template_id(&self) -> u16 {
        match self {
            Self::OpenMessageSubscription(_) => OpenMessageSubscription::TEMPLATE_ID,
            Self::OpenWorkflowInstanceSubscription(_) => {
                OpenWorkflowInstanceSubscription::TEMPLATE_ID
            }
            Self::CorrelateWorkflowInstanceSubscription(_) => {
                CorrelateWorkflowInstanceSubscription::TEMPLATE_ID
            }
            Self::CorrelateMessageSubscription(_) => CorrelateMessageSubscription::TEMPLATE_ID,
            Self::CloseMessageSubscription(_) => CloseMessageSubscription::TEMPLATE_ID,
        }
    }
}

macro_rules! impl_from_message {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for SubscriptionCommand {
                fn from(message: $variant) -> Self {
                    Self::$variant(message)
                }
            }
        )*
    };
}

impl_from_message!(
    OpenMessageSubscription,
    OpenWorkflowInstanceSubscription,
    CorrelateWorkflowInstanceSubscription,
    CorrelateMessageSubscription,
    CloseMessageSubscription,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HEADER_LENGTH;

    fn address() -> SubscriptionAddress {
        SubscriptionAddress {
            subscription_partition_id: 2,
            workflow_instance_partition_id: 1,
            workflow_instance_key: 0x0102,
            activity_instance_key: 7,
        }
    }

    #[test]
    fn test_open_message_subscription_layout() {
        let msg = OpenMessageSubscription {
            address: address(),
            message_name: "order".to_string(),
            correlation_key: "k1".to_string(),
        };
        let bytes = msg.to_bytes().unwrap();

        assert_eq!(bytes.len(), msg.encoded_len());
        assert_eq!(bytes.len(), HEADER_LENGTH + 20 + 2 + 5 + 2 + 2);
        // header
        assert_eq!(&bytes[..8], &[20, 0, 0, 0, 1, 0, 1, 0]);
        // partition ids
        assert_eq!(&bytes[8..12], &[2, 0, 1, 0]);
        // workflow instance key, little-endian
        assert_eq!(&bytes[12..20], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        // activity instance key
        assert_eq!(&bytes[20..28], &[7, 0, 0, 0, 0, 0, 0, 0]);
        // message name
        assert_eq!(&bytes[28..35], b"\x05\x00order");
        // correlation key
        assert_eq!(&bytes[35..], b"\x02\x00k1");
    }

    #[test]
    fn test_correlate_payload_uses_wide_length_prefix() {
        let msg = CorrelateWorkflowInstanceSubscription {
            address: address(),
            message_name: "m".to_string(),
            payload: Bytes::from_static(b"{\"a\":1}"),
        };
        let bytes = msg.to_bytes().unwrap();
        let payload_offset = HEADER_LENGTH + 20 + 3;
        assert_eq!(&bytes[payload_offset..payload_offset + 4], &[7, 0, 0, 0]);

        let decoded = CorrelateWorkflowInstanceSubscription::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_skips_unknown_trailing_block_fields() {
        let msg = CloseMessageSubscription {
            address: address(),
            message_name: "cancel".to_string(),
        };
        let mut buf = BytesMut::new();
        MessageHeader::new(CloseMessageSubscription::TEMPLATE_ID, 24).encode(&mut buf);
        msg.encode_block(&mut buf);
        buf.put_u32_le(0xdead_beef);
        msg.encode_var(&mut buf).unwrap();

        let decoded = CloseMessageSubscription::from_bytes(&buf).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_oversized_correlation_key_is_not_encoded() {
        let msg = OpenMessageSubscription {
            address: address(),
            message_name: "order".to_string(),
            correlation_key: "k".repeat(crate::MAX_STRING_LENGTH + 1),
        };
        let command = SubscriptionCommand::from(msg);
        assert_eq!(
            command.to_bytes(),
            Err(EncodeError::FieldTooLong {
                field: "correlationKey",
                length: crate::MAX_STRING_LENGTH + 1
            })
        );
    }

    #[test]
    fn test_decode_rejects_wrong_template() {
        let msg = CorrelateMessageSubscription {
            address: address(),
            message_name: "m".to_string(),
        };
        let err = OpenMessageSubscription::from_bytes(&msg.to_bytes().unwrap()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnexpectedTemplate {
                expected: 0,
                actual: 3
            }
        );
    }

    #[test]
    fn test_decode_rejects_short_block() {
        let mut buf = BytesMut::new();
        MessageHeader::new(CloseMessageSubscription::TEMPLATE_ID, 12).encode(&mut buf);
        buf.put_slice(&[0u8; 12]);
        let err = CloseMessageSubscription::from_bytes(&buf).unwrap_err();
        assert_eq!(
            err,
            DecodeError::BlockTooShort {
                minimum: 20,
                actual: 12
            }
        );
    }

    #[test]
    fn test_command_dispatch_and_routing() {
        let open = SubscriptionCommand::OpenMessageSubscription(OpenMessageSubscription {
            address: address(),
            message_name: "m".to_string(),
            correlation_key: "k".to_string(),
        });
        let reply =
            SubscriptionCommand::OpenWorkflowInstanceSubscription(OpenWorkflowInstanceSubscription {
                address: address(),
                message_name: "m".to_string(),
            });

        assert_eq!(open.target_partition_id(), 2);
        assert_eq!(reply.target_partition_id(), 1);

        let decoded = SubscriptionCommand::from_bytes(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(decoded.template_id(), 1);
    }

    #[test]
    fn test_command_unknown_template() {
        let mut buf = BytesMut::new();
        MessageHeader::new(42, 0).encode(&mut buf);
        assert_eq!(
            SubscriptionCommand::from_bytes(&buf),
            Err(DecodeError::UnknownTemplate(42))
        );
    }

    #[test]
    fn test_truncated_tail_is_reported() {
        let msg = OpenMessageSubscription {
            address: address(),
            message_name: "order".to_string(),
            correlation_key: "key".to_string(),
        };
        let bytes = msg.to_bytes().unwrap();
        let err = OpenMessageSubscription::from_bytes(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }
}
