use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, opts, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub struct MethodVec: IntCounter {
        "method" => {
            password,
            publickey,
        }
    }
    pub struct ResultVec: IntCounter {
        "method" => {
            password,
            publickey,
        },
        "result" => {
            accept,
            reject,
        }
    }
    pub struct PreflightVec: IntCounter {
        "check" => {
            firewall,
            billing,
        },
        "result" => {
            pass,
            block,
            error,
        }
    }
    pub struct RequestVec: IntCounter {
        "method" => {
            pty,
            shell,
            exec,
            sftp,
            window_resize,
            env,
        }
    }
    pub struct ChannelVec: IntCounter {
        "method" => {
            open_session,
            close,
            eof,
            direct_tcpip,
            agent_forward,
        }
    }
}

lazy_static! {
    pub static ref TOTAL_BYTES: IntCounter =
        register_int_counter!("bytes_received_total", "Total number of bytes received").unwrap();
    pub static ref TOTAL_SESSIONS: IntCounter =
        register_int_counter!("session_total", "Total number of sessions").unwrap();
    pub static ref ACTIVE_SESSIONS: IntGauge =
        register_int_gauge!("active_sessions", "Number of active sessions").unwrap();
    pub static ref SESSION_DURATION: Histogram = register_histogram!(histogram_opts!(
        "session_duration_minutes",
        "Session duration",
        vec!(0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0),
    ))
    .unwrap();
    pub static ref UNEXPECTED_STATE: IntCounterVec = register_int_counter_vec!(
        opts!(
            "unexpected_state_total",
            "Number of times an unexpected state was encountered",
        ),
        &["expected", "actual"],
    )
    .unwrap();
    pub static ref KEEPALIVES: IntCounter = register_int_counter!(
        "session_keepalives_total",
        "Device heartbeats relayed to the session registry"
    )
    .unwrap();
    pub static ref REJECTIONS: IntCounterVec = register_int_counter_vec!(
        opts!("session_rejections_total", "Sessions rejected before piping"),
        &["reason"],
    )
    .unwrap();
    pub static ref SESSION_KINDS: IntCounterVec = register_int_counter_vec!(
        opts!("session_kinds_total", "Sessions by classified type"),
        &["kind"],
    )
    .unwrap();
}

lazy_static! {
    static ref AUTH_ATTEMPTS_VEC: IntCounterVec = register_int_counter_vec!(
        opts!(
            "auth_attempts_total",
            "Number of authentication attempts. `password` counts every attempt even though \
             the credential is only checked against the device later."
        ),
        &["method"]
    )
    .unwrap();
    pub static ref AUTH_ATTEMPTS: MethodVec = MethodVec::from(&AUTH_ATTEMPTS_VEC);
    static ref AUTH_RESULTS_VEC: IntCounterVec = register_int_counter_vec!(
        opts!(
            "auth_results_total",
            "Results of authentication attempts at the gateway layer",
        ),
        &["method", "result"],
    )
    .unwrap();
    pub static ref AUTH_RESULTS: ResultVec = ResultVec::from(&AUTH_RESULTS_VEC);
}

lazy_static! {
    static ref PREFLIGHTS_VEC: IntCounterVec = register_int_counter_vec!(
        opts!("preflights_total", "Preflight checks by result"),
        &["check", "result"],
    )
    .unwrap();
    pub static ref PREFLIGHTS: PreflightVec = PreflightVec::from(&PREFLIGHTS_VEC);
}

lazy_static! {
    static ref REQUESTS_VEC: IntCounterVec =
        register_int_counter_vec!(opts!("requests_total", "Number of requests",), &["method"])
            .unwrap();
    pub static ref REQUESTS: RequestVec = RequestVec::from(&REQUESTS_VEC);
    static ref CHANNELS_VEC: IntCounterVec = register_int_counter_vec!(
        opts!("channels_total", "Number of channel actions",),
        &["method"]
    )
    .unwrap();
    pub static ref CHANNELS: ChannelVec = ChannelVec::from(&CHANNELS_VEC);
}
