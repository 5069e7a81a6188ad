use millet::{co, nap, now, preallocate_coroutine_stacks, run};

fn main() {
    let count = preallocate_coroutine_stacks(16, 64 * 1024);
    println!("{} stacks ready", count);

    let start = now();
    co(move || {
        nap(50);
        println!("world, after {}ms", now() - start);
    });
    co(move || {
        nap(10);
        println!("hello, after {}ms", now() - start);
    });
    //两个协程都结束后才返回
    run();
}
