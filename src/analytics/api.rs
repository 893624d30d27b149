//! Wire types and client stub for the analytics RPC service.
//!
//! These bindings mirror `proto/analytics.proto` and are maintained by
//! hand so the crate builds without a protoc toolchain. Field tags and
//! enum values must stay in sync with the schema: the enum values are
//! also serialized into the frame fingerprint (see the fingerprint
//! module), so renumbering them breaks deduplication downstream.

/// Radio modulation reported by the packet forwarder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Modulation {
    Unknown = 0,
    Lora = 1,
    Fsk = 2,
}

/// CRC state of a received frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CrcStatus {
    Missing = 0,
    Ok = 1,
    Fail = 2,
}

/// Coding rate "4/x", encoded as the denominator x.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LoraCodingRate {
    CrUnknown = 0,
    CrOff = 1,
    Cr45 = 5,
    Cr46 = 6,
    Cr47 = 7,
    Cr48 = 8,
    Cr49 = 9,
    Cr410 = 10,
    Cr411 = 11,
    Cr412 = 12,
    Cr413 = 13,
    Cr414 = 14,
    Cr415 = 15,
    Cr416 = 16,
}

/// LoRa spreading factor, encoded as the SF number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LoraSf {
    SfUnknown = 0,
    Sf7 = 7,
    Sf8 = 8,
    Sf9 = 9,
    Sf10 = 10,
    Sf11 = 11,
    Sf12 = 12,
}

/// LoRa channel bandwidth, encoded as kHz.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LoraBw {
    BwUnknown = 0,
    Bw125k = 125,
    Bw250k = 250,
    Bw500k = 500,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct LoraDataRate {
    #[prost(enumeration = "LoraSf", tag = "1")]
    pub spreading_factor: i32,
    #[prost(enumeration = "LoraBw", tag = "2")]
    pub bandwidth: i32,
}

/// Per-antenna signal details (from the Kerlink "rsig" extension).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AnalyticsUplinkAntenna {
    #[prost(int32, tag = "1")]
    pub antenna: i32,
    #[prost(int32, tag = "2")]
    pub if_chan: i32,
    #[prost(int32, tag = "3")]
    pub rssic: i32,
    #[prost(int32, optional, tag = "4")]
    pub rssis: ::core::option::Option<i32>,
    #[prost(int32, optional, tag = "5")]
    pub rssisd: ::core::option::Option<i32>,
    #[prost(float, tag = "6")]
    pub lsnr: f32,
    #[prost(bytes = "vec", tag = "7")]
    pub etime: ::prost::alloc::vec::Vec<u8>,
    #[prost(int64, optional, tag = "8")]
    pub ftime: ::core::option::Option<i64>,
    #[prost(int32, optional, tag = "9")]
    pub foff: ::core::option::Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AnalyticsUplink {
    /// Wall-clock reception time, microseconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub rx_wall_time: i64,
    #[prost(int64, tag = "2")]
    pub rx_finished_time: i64,
    #[prost(int64, tag = "3")]
    pub rx_gps_time: i64,
    #[prost(float, tag = "4")]
    pub frequency: f32,
    #[prost(uint32, tag = "5")]
    pub rf_chain: u32,
    #[prost(enumeration = "LoraCodingRate", tag = "6")]
    pub coding_rate: i32,
    #[prost(enumeration = "CrcStatus", tag = "7")]
    pub crc: i32,
    #[prost(enumeration = "Modulation", tag = "8")]
    pub modulation: i32,
    #[prost(oneof = "analytics_uplink::DataRate", tags = "9, 10")]
    pub data_rate: ::core::option::Option<analytics_uplink::DataRate>,
    #[prost(message, repeated, tag = "11")]
    pub ant: ::prost::alloc::vec::Vec<AnalyticsUplinkAntenna>,
    #[prost(uint32, tag = "12")]
    pub size: u32,
    /// SHA-1 over payload plus radio parameters, see the fingerprint module.
    #[prost(bytes = "vec", tag = "13")]
    pub unique_id: ::prost::alloc::vec::Vec<u8>,
    /// Leading MAC-header slice of the PHY payload.
    #[prost(bytes = "vec", tag = "14")]
    pub fhdr: ::prost::alloc::vec::Vec<u8>,
}

/// Nested message and enum types in `AnalyticsUplink`.
pub mod analytics_uplink {
    #[derive(Clone, Copy, PartialEq, ::prost::Oneof)]
    pub enum DataRate {
        #[prost(message, tag = "9")]
        DataRateLora(super::LoraDataRate),
        #[prost(uint32, tag = "10")]
        DataRateFsk(u32),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AnalyticsDownlink {
    #[prost(int64, tag = "1")]
    pub tx_time: i64,
    #[prost(int64, tag = "2")]
    pub tx_gps_time: i64,
    #[prost(float, tag = "3")]
    pub fsk_freq_dev: f32,
    #[prost(float, tag = "4")]
    pub frequency: f32,
    #[prost(uint32, tag = "5")]
    pub channel: u32,
    #[prost(uint32, tag = "6")]
    pub rf_chain: u32,
    #[prost(float, tag = "7")]
    pub power: f32,
    #[prost(enumeration = "Modulation", tag = "8")]
    pub modulation: i32,
    #[prost(enumeration = "LoraCodingRate", tag = "9")]
    pub coding_rate: i32,
    #[prost(oneof = "analytics_downlink::DataRate", tags = "10, 11")]
    pub data_rate: ::core::option::Option<analytics_downlink::DataRate>,
    #[prost(bool, tag = "12")]
    pub invert_polarity: bool,
    #[prost(bool, tag = "13")]
    pub immediately: bool,
    #[prost(uint32, tag = "14")]
    pub rf_preamble: u32,
    #[prost(uint32, tag = "15")]
    pub size: u32,
    #[prost(bool, tag = "16")]
    pub no_crc: bool,
    /// Wall-clock time the downlink crossed the relay, milliseconds.
    #[prost(int64, tag = "17")]
    pub rx_wall_time: i64,
    #[prost(bytes = "vec", tag = "18")]
    pub unique_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "19")]
    pub fhdr: ::prost::alloc::vec::Vec<u8>,
}

/// Nested message and enum types in `AnalyticsDownlink`.
pub mod analytics_downlink {
    #[derive(Clone, Copy, PartialEq, ::prost::Oneof)]
    pub enum DataRate {
        #[prost(message, tag = "10")]
        DataRateLora(super::LoraDataRate),
        #[prost(uint32, tag = "11")]
        DataRateFsk(u32),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AnalyticsStat {
    /// Gateway-reported time, milliseconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub gw_time: i64,
    #[prost(float, tag = "2")]
    pub gw_latitude: f32,
    #[prost(float, tag = "3")]
    pub gw_longitude: f32,
    #[prost(float, tag = "4")]
    pub gw_altitude: f32,
    #[prost(uint32, tag = "5")]
    pub rx_packets: u32,
    #[prost(uint32, tag = "6")]
    pub rx_with_valid_phy_crc: u32,
    #[prost(uint32, tag = "7")]
    pub rx_forwarded: u32,
    #[prost(float, tag = "8")]
    pub rx_ackr: f32,
    #[prost(uint32, tag = "9")]
    pub tx_received: u32,
    #[prost(uint32, tag = "10")]
    pub tx_emitted: u32,
    #[prost(bool, tag = "11")]
    pub is_gauge: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AnalyticsInternalMetrics {
    #[prost(string, tag = "1")]
    pub gateway_ip: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub up_rx_packets: u64,
    #[prost(uint64, tag = "3")]
    pub up_tx_packets: u64,
    #[prost(uint64, tag = "4")]
    pub dn_rx_packets: u64,
    #[prost(uint64, tag = "5")]
    pub dn_tx_packets: u64,
    #[prost(uint64, tag = "6")]
    pub pkt_push_data: u64,
    #[prost(uint64, tag = "7")]
    pub pkt_push_ack: u64,
    #[prost(uint64, tag = "8")]
    pub pkt_pull_data: u64,
    #[prost(uint64, tag = "9")]
    pub pkt_pull_resp: u64,
    #[prost(uint64, tag = "10")]
    pub pkt_pull_ack: u64,
    #[prost(uint64, tag = "11")]
    pub pkt_tx_ack: u64,
}

/// One batch of converted records for a single gateway stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AnalyticsMetrics {
    #[prost(bytes = "vec", tag = "1")]
    pub gateway_eui: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub gateway_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub uplinks: ::prost::alloc::vec::Vec<AnalyticsUplink>,
    #[prost(message, repeated, tag = "4")]
    pub downlinks: ::prost::alloc::vec::Vec<AnalyticsDownlink>,
    #[prost(message, repeated, tag = "5")]
    pub stats: ::prost::alloc::vec::Vec<AnalyticsStat>,
    #[prost(message, optional, tag = "6")]
    pub metrics: ::core::option::Option<AnalyticsInternalMetrics>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReqHello {
    #[prost(int32, tag = "1")]
    pub version: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RespHello {
    #[prost(int32, tag = "1")]
    pub revision: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub challenge: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqLogin {
    #[prost(bytes = "vec", tag = "1")]
    pub client_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub hash: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "3")]
    pub server_side: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RespLogin {
    #[prost(string, tag = "1")]
    pub access_token: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RespPush {}

/// Generated client implementations.
pub mod analytics_server_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::http::uri::PathAndQuery;
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct AnalyticsServerClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl AnalyticsServerClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> AnalyticsServerClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        async fn ready(&mut self) -> Result<(), tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })
        }

        pub async fn hello(
            &mut self,
            request: impl tonic::IntoRequest<super::ReqHello>,
        ) -> Result<tonic::Response<super::RespHello>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/analytics.AnalyticsServer/Hello");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("analytics.AnalyticsServer", "Hello"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn login(
            &mut self,
            request: impl tonic::IntoRequest<super::ReqLogin>,
        ) -> Result<tonic::Response<super::RespLogin>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/analytics.AnalyticsServer/Login");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("analytics.AnalyticsServer", "Login"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn push_metrics(
            &mut self,
            request: impl tonic::IntoRequest<super::AnalyticsMetrics>,
        ) -> Result<tonic::Response<super::RespPush>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/analytics.AnalyticsServer/PushMetrics");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("analytics.AnalyticsServer", "PushMetrics"));
            self.inner.unary(req, path, codec).await
        }
    }
}
