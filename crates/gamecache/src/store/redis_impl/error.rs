//! Redis error mapping to CacheError.

use gamecache_core::CacheError;

/// Maps Redis errors to CacheError.
///
/// Transport failures become [`CacheError::ConnectionFault`] so the pool
/// disposes the connection; everything else is a command failure.
pub fn map_redis_error(err: redis::RedisError) -> CacheError {
    if err.is_connection_refusal()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_io_error()
    {
        CacheError::ConnectionFault(err.to_string())
    } else {
        CacheError::OperationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_errors_are_operation_failures() {
        let err = redis::RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(map_redis_error(err), CacheError::OperationFailed(_)));
    }

    #[test]
    fn test_io_errors_are_connection_faults() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = map_redis_error(redis::RedisError::from(io));
        assert!(err.is_connection_fault());
    }
}
