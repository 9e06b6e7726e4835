use std::{mem, ptr};

use libc::{c_int, c_void, socklen_t};
use strand::hook;

fn serve(fd: c_int) {
    let mut buf = [0u8; 1024];
    loop {
        let n = unsafe { hook::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        let mut written = 0;
        while written < n {
            let m = unsafe {
                hook::write(fd, buf[written as usize..].as_ptr() as *const c_void, (n - written) as usize)
            };
            if m <= 0 {
                hook::close(fd);
                return;
            }
            written += m;
        }
    }
    hook::close(fd);
}

#[strand::main(threads = 4)]
fn main() {
    let listener = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    assert!(listener >= 0, "failed to create listener");

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = 8007u16.to_be();
    addr.sin_addr.s_addr = u32::from_be_bytes([127, 0, 0, 1]).to_be();
    let rc = unsafe {
        libc::bind(
            listener,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as socklen_t,
        )
    };
    assert_eq!(rc, 0, "failed to bind 127.0.0.1:8007");
    assert_eq!(unsafe { libc::listen(listener, 128) }, 0);
    eprintln!("echoing on 127.0.0.1:8007");

    let mut id_counter = 0u64;
    loop {
        let fd = unsafe { hook::accept(listener, ptr::null_mut(), ptr::null_mut()) };
        if fd < 0 {
            break;
        }
        id_counter += 1;
        let id = id_counter;
        strand::spawn(move || {
            eprintln!("{:010}: serving fd {}", id, fd);
            serve(fd);
            eprintln!("{:010}: closed fd {}", id, fd);
        });
    }
}
