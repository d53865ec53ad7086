/*!
 * Synchronization Primitives
 *
 * Blocking primitives shared by the admission limiters.
 *
 * # Architecture
 *
 * Built on `parking_lot::{Mutex, Condvar}`: state lives behind one mutex and
 * waiters park on a condvar, re-checking their predicate after every wake.
 *
 * # Use Cases
 *
 * - **Bounded executor**: counting admission tokens with timeout
 * - **Batch admission**: all-or-nothing acquisition of several tokens
 */

mod semaphore;

pub use semaphore::{AcquireError, Semaphore, SemaphorePermit};
