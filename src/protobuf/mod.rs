//! Meshtastic protobuf messages used on the stream API.
//!
//! Only the subset of `mesh.proto` / `portnums.proto` the relay reads or writes is declared
//! here, with field tags matching the upstream schema. Unknown fields and oneof variants are
//! skipped by prost during decoding, so newer firmware stays compatible.

pub mod meshtastic {
    #![allow(clippy::derive_partial_eq_without_eq)]

    /// Application port numbers (`portnums.proto`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum PortNum {
        UnknownApp = 0,
        TextMessageApp = 1,
        RemoteHardwareApp = 2,
        PositionApp = 3,
        NodeinfoApp = 4,
        RoutingApp = 5,
        AdminApp = 6,
        TextMessageCompressedApp = 7,
        WaypointApp = 8,
        DetectionSensorApp = 10,
        ReplyApp = 32,
        RangeTestApp = 66,
        TelemetryApp = 67,
        TracerouteApp = 70,
        NeighborinfoApp = 71,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Data {
        #[prost(enumeration = "PortNum", tag = "1")]
        pub portnum: i32,
        #[prost(bytes = "vec", tag = "2")]
        pub payload: Vec<u8>,
        #[prost(bool, tag = "3")]
        pub want_response: bool,
        #[prost(fixed32, tag = "4")]
        pub dest: u32,
        #[prost(fixed32, tag = "5")]
        pub source: u32,
        #[prost(fixed32, tag = "6")]
        pub request_id: u32,
        #[prost(fixed32, tag = "7")]
        pub reply_id: u32,
        #[prost(fixed32, tag = "8")]
        pub emoji: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MeshPacket {
        #[prost(fixed32, tag = "1")]
        pub from: u32,
        #[prost(fixed32, tag = "2")]
        pub to: u32,
        #[prost(uint32, tag = "3")]
        pub channel: u32,
        #[prost(fixed32, tag = "6")]
        pub id: u32,
        #[prost(fixed32, tag = "7")]
        pub rx_time: u32,
        #[prost(float, tag = "8")]
        pub rx_snr: f32,
        #[prost(uint32, tag = "9")]
        pub hop_limit: u32,
        #[prost(bool, tag = "10")]
        pub want_ack: bool,
        #[prost(int32, tag = "11")]
        pub priority: i32,
        #[prost(int32, tag = "12")]
        pub rx_rssi: i32,
        #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
        pub payload_variant: Option<mesh_packet::PayloadVariant>,
    }

    pub mod mesh_packet {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum PayloadVariant {
            #[prost(message, tag = "4")]
            Decoded(super::Data),
            #[prost(bytes, tag = "5")]
            Encrypted(Vec<u8>),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct User {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(string, tag = "2")]
        pub long_name: String,
        #[prost(string, tag = "3")]
        pub short_name: String,
        #[prost(int32, tag = "5")]
        pub hw_model: i32,
    }

    /// Board models (`HardwareModel` in `mesh.proto`); only boards commonly seen on meshes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum HardwareModel {
        Unset = 0,
        TloraV2 = 1,
        TloraV1 = 2,
        TloraV211p6 = 3,
        Tbeam = 4,
        HeltecV20 = 5,
        TbeamV0p7 = 6,
        TEcho = 7,
        TloraV11p3 = 8,
        Rak4631 = 9,
        HeltecV21 = 10,
        HeltecV1 = 11,
        LilygoTbeamS3Core = 12,
        Rak11200 = 13,
        NanoG1 = 14,
        TloraV211p8 = 15,
        TloraT3S3 = 16,
        NanoG1Explorer = 17,
        NanoG2Ultra = 18,
        StationG1 = 25,
        Rak11310 = 26,
        StationG2 = 31,
        DiyV1 = 39,
        M5stack = 42,
        HeltecV3 = 43,
        HeltecWslV3 = 44,
        RpiPico = 47,
        HeltecWirelessTracker = 48,
        HeltecWirelessPaper = 49,
        TDeck = 50,
        TWatchS3 = 51,
        PrivateHw = 255,
    }

    impl HardwareModel {
        /// Upstream enum name, e.g. `HELTEC_V3`.
        pub fn as_str_name(&self) -> &'static str {
            match self {
                HardwareModel::Unset => "UNSET",
                HardwareModel::TloraV2 => "TLORA_V2",
                HardwareModel::TloraV1 => "TLORA_V1",
                HardwareModel::TloraV211p6 => "TLORA_V2_1_1P6",
                HardwareModel::Tbeam => "TBEAM",
                HardwareModel::HeltecV20 => "HELTEC_V2_0",
                HardwareModel::TbeamV0p7 => "TBEAM_V0P7",
                HardwareModel::TEcho => "T_ECHO",
                HardwareModel::TloraV11p3 => "TLORA_V1_1P3",
                HardwareModel::Rak4631 => "RAK4631",
                HardwareModel::HeltecV21 => "HELTEC_V2_1",
                HardwareModel::HeltecV1 => "HELTEC_V1",
                HardwareModel::LilygoTbeamS3Core => "LILYGO_TBEAM_S3_CORE",
                HardwareModel::Rak11200 => "RAK11200",
                HardwareModel::NanoG1 => "NANO_G1",
                HardwareModel::TloraV211p8 => "TLORA_V2_1_1P8",
                HardwareModel::TloraT3S3 => "TLORA_T3_S3",
                HardwareModel::NanoG1Explorer => "NANO_G1_EXPLORER",
                HardwareModel::NanoG2Ultra => "NANO_G2_ULTRA",
                HardwareModel::StationG1 => "STATION_G1",
                HardwareModel::Rak11310 => "RAK11310",
                HardwareModel::StationG2 => "STATION_G2",
                HardwareModel::DiyV1 => "DIY_V1",
                HardwareModel::M5stack => "M5STACK",
                HardwareModel::HeltecV3 => "HELTEC_V3",
                HardwareModel::HeltecWslV3 => "HELTEC_WSL_V3",
                HardwareModel::RpiPico => "RPI_PICO",
                HardwareModel::HeltecWirelessTracker => "HELTEC_WIRELESS_TRACKER",
                HardwareModel::HeltecWirelessPaper => "HELTEC_WIRELESS_PAPER",
                HardwareModel::TDeck => "T_DECK",
                HardwareModel::TWatchS3 => "T_WATCH_S3",
                HardwareModel::PrivateHw => "PRIVATE_HW",
            }
        }
    }

    /// Power and airtime readings (`telemetry.proto`).
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeviceMetrics {
        #[prost(uint32, optional, tag = "1")]
        pub battery_level: Option<u32>,
        #[prost(float, optional, tag = "2")]
        pub voltage: Option<f32>,
        #[prost(float, optional, tag = "3")]
        pub channel_utilization: Option<f32>,
        #[prost(float, optional, tag = "4")]
        pub air_util_tx: Option<f32>,
    }

    /// TELEMETRY_APP payload. Upstream `device_metrics` sits in a oneof; as a single
    /// optional field it has the same encoding.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Telemetry {
        #[prost(fixed32, tag = "1")]
        pub time: u32,
        #[prost(message, optional, tag = "2")]
        pub device_metrics: Option<DeviceMetrics>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NodeInfo {
        #[prost(uint32, tag = "1")]
        pub num: u32,
        #[prost(message, optional, tag = "2")]
        pub user: Option<User>,
        #[prost(float, tag = "4")]
        pub snr: f32,
        #[prost(fixed32, tag = "5")]
        pub last_heard: u32,
        #[prost(message, optional, tag = "6")]
        pub device_metrics: Option<DeviceMetrics>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MyNodeInfo {
        #[prost(uint32, tag = "1")]
        pub my_node_num: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FromRadio {
        #[prost(uint32, tag = "1")]
        pub id: u32,
        #[prost(oneof = "from_radio::PayloadVariant", tags = "2, 3, 4, 7, 8")]
        pub payload_variant: Option<from_radio::PayloadVariant>,
    }

    pub mod from_radio {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum PayloadVariant {
            #[prost(message, tag = "2")]
            Packet(super::MeshPacket),
            #[prost(message, tag = "3")]
            MyInfo(super::MyNodeInfo),
            #[prost(message, tag = "4")]
            NodeInfo(super::NodeInfo),
            #[prost(uint32, tag = "7")]
            ConfigCompleteId(u32),
            #[prost(bool, tag = "8")]
            Rebooted(bool),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Heartbeat {
        #[prost(uint32, tag = "1")]
        pub nonce: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ToRadio {
        #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
        pub payload_variant: Option<to_radio::PayloadVariant>,
    }

    pub mod to_radio {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum PayloadVariant {
            #[prost(message, tag = "1")]
            Packet(super::MeshPacket),
            #[prost(uint32, tag = "3")]
            WantConfigId(u32),
            #[prost(bool, tag = "4")]
            Disconnect(bool),
            #[prost(message, tag = "7")]
            Heartbeat(super::Heartbeat),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::meshtastic::*;
    use prost::Message;

    #[test]
    fn unknown_port_numbers_do_not_decode_as_text() {
        assert_eq!(PortNum::try_from(1).ok(), Some(PortNum::TextMessageApp));
        assert!(PortNum::try_from(9999).is_err());
    }

    #[test]
    fn hardware_models_have_upstream_names() {
        assert_eq!(
            HardwareModel::try_from(43).map(|m| m.as_str_name()).ok(),
            Some("HELTEC_V3")
        );
        assert!(HardwareModel::try_from(4000).is_err());
    }

    #[test]
    fn node_info_carries_device_metrics() {
        let info = NodeInfo {
            num: 5,
            device_metrics: Some(DeviceMetrics {
                battery_level: Some(71),
                voltage: Some(3.92),
                ..Default::default()
            }),
            ..Default::default()
        };
        let decoded = NodeInfo::decode(info.encode_to_vec().as_slice()).expect("decode");
        let metrics = decoded.device_metrics.expect("metrics present");
        assert_eq!(metrics.battery_level, Some(71));
        assert_eq!(metrics.channel_utilization, None);
    }

    #[test]
    fn text_packet_survives_the_wire() {
        let packet = MeshPacket {
            from: 0x0000_aaaa,
            to: 0xffff_ffff,
            channel: 2,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: b"hello".to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        };
        let frame = FromRadio {
            id: 7,
            payload_variant: Some(from_radio::PayloadVariant::Packet(packet.clone())),
        };
        let bytes = frame.encode_to_vec();
        let decoded = FromRadio::decode(bytes.as_slice()).expect("decode");
        assert_eq!(
            decoded.payload_variant,
            Some(from_radio::PayloadVariant::Packet(packet))
        );
    }
}
