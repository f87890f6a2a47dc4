use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Ports;
use crate::model::InstanceId;
use crate::ports::{PortAllocator, PortError};

fn allocator(from: u16, to: u16) -> PortAllocator {
    PortAllocator::new(&Ports {
        from,
        to,
        check_bindable: false,
    })
}

#[test]
fn test_reserve_returns_lowest_free_port() {
    let ports = allocator(8000, 8010);
    assert_eq!(ports.reserve().unwrap().port, 8000);
    assert_eq!(ports.reserve().unwrap().port, 8001);

    ports.release(8000).unwrap();
    assert_eq!(ports.reserve().unwrap().port, 8000);
    assert_eq!(ports.reserve().unwrap().port, 8002);
}

#[test]
fn test_pool_exhaustion() {
    let ports = allocator(8000, 8001);
    ports.reserve().unwrap();
    ports.reserve().unwrap();
    assert_eq!(
        ports.reserve(),
        Err(PortError::PoolExhausted { from: 8000, to: 8001 })
    );
    assert_eq!(ports.available(), 0);
}

#[test]
fn test_release_of_unleased_port_fails() {
    let ports = allocator(8000, 8005);
    assert_eq!(ports.release(8003), Err(PortError::NotLeased(8003)));

    let lease = ports.reserve().unwrap();
    ports.release(lease.port).unwrap();
    assert_eq!(ports.release(lease.port), Err(PortError::NotLeased(lease.port)));
}

#[test]
fn test_assign_records_holder() {
    let ports = allocator(8000, 8005);
    let lease = ports.reserve().unwrap();
    assert!(lease.holder.is_none());

    ports.assign(lease.port, InstanceId::from("api-1")).unwrap();
    let leases = ports.leases();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].holder, Some(InstanceId::from("api-1")));

    assert_eq!(
        ports.assign(8004, InstanceId::from("api-2")),
        Err(PortError::NotLeased(8004))
    );
}

#[test]
fn test_bindable_check_skips_ports_in_use() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let busy = listener.local_addr().unwrap().port();

    let ports = PortAllocator::new(&Ports {
        from: busy,
        to: busy.saturating_add(3),
        check_bindable: true,
    });
    let lease = ports.reserve().unwrap();
    assert_ne!(lease.port, busy);
}

#[test]
fn test_concurrent_reservations_never_collide() {
    let ports = Arc::new(allocator(20000, 20199));
    let seen = Arc::new(Mutex::new(HashSet::new()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ports = ports.clone();
            let seen = seen.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let lease = ports.reserve().unwrap();
                    assert!(
                        seen.lock().insert(lease.port),
                        "port {} handed out twice",
                        lease.port
                    );
                    if lease.port % 2 == 0 {
                        assert!(seen.lock().remove(&lease.port));
                        ports.release(lease.port).unwrap();
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let leased: HashSet<u16> = ports.leases().into_iter().map(|l| l.port).collect();
    assert_eq!(leased, *seen.lock());
}
