use std::path::Path;

use kiri::{
   identity::{DatabaseIdentity, normalize_db_path},
   usock::IpcAddress,
};
use proptest::prelude::*;

proptest! {
   #[test]
   fn normalization_is_idempotent(segments in prop::collection::vec("[a-z]{1,6}|\\.|\\.\\.", 1..6)) {
      let dir = tempfile::tempdir().unwrap();
      let mut path = dir.path().to_path_buf();
      for segment in &segments {
         path.push(segment);
      }
      path.push("index.db");

      let once = normalize_db_path(&path);
      let twice = normalize_db_path(&once);
      prop_assert_eq!(&once, &twice);
      prop_assert!(once.is_absolute());
   }
}

#[test]
fn relative_and_absolute_spellings_agree() {
   let dir = tempfile::tempdir().unwrap();
   std::fs::create_dir_all(dir.path().join("data")).unwrap();
   let direct = DatabaseIdentity::prepare(&dir.path().join("data/index.db")).unwrap();
   let dotted = DatabaseIdentity::prepare(&dir.path().join("data/./../data/index.db")).unwrap();
   assert_eq!(direct, dotted);
   assert_eq!(direct.address(), dotted.address());
}

#[cfg(unix)]
#[test]
fn symlinked_parent_collapses_to_one_identity() {
   let dir = tempfile::tempdir().unwrap();
   let real = dir.path().join("real");
   std::fs::create_dir_all(&real).unwrap();
   let link = dir.path().join("link");
   std::os::unix::fs::symlink(&real, &link).unwrap();

   let via_real = DatabaseIdentity::prepare(&real.join("index.db")).unwrap();
   let via_link = DatabaseIdentity::prepare(&link.join("index.db")).unwrap();
   assert_eq!(via_real.db_path(), via_link.db_path());
   assert_eq!(via_real.pid_path(), via_link.pid_path());
   assert_eq!(via_real.starting_path(), via_link.starting_path());
}

#[test]
fn distinct_databases_get_distinct_channels() {
   let a = Path::new("/data/a/index.db");
   let b = Path::new("/data/b/index.db");
   assert_ne!(IpcAddress::socket_for(a), IpcAddress::socket_for(b));
   assert_ne!(IpcAddress::pipe_for(a), IpcAddress::pipe_for(b));
   assert_eq!(IpcAddress::pipe_for(a), IpcAddress::pipe_for(a));
}

#[test]
fn socket_address_round_trips_through_its_display_form() {
   let db = Path::new("/data/a/index.db");
   let address = IpcAddress::socket_for(db);
   assert_eq!(IpcAddress::parse(&address.to_string()), address);
   assert_eq!(address.database_path().as_deref(), Some(db));
   assert!(IpcAddress::pipe_for(db).database_path().is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn socket_bind_is_owner_only_and_keeps_the_process_umask() {
   use std::os::unix::fs::PermissionsExt;

   use kiri::usock::Listener;

   let dir = tempfile::tempdir().unwrap();
   let address = IpcAddress::socket_for(&dir.path().join("index.db"));

   // SAFETY: umask only swaps the process file-creation mask.
   let original = unsafe { libc::umask(0o002) };
   let listener = Listener::bind(&address).await;
   // SAFETY: as above; puts the original mask back.
   let after_bind = unsafe { libc::umask(original) };
   let _listener = listener.unwrap();

   assert_eq!(after_bind, 0o002);
   let mode = std::fs::metadata(address.socket_file().unwrap())
      .unwrap()
      .permissions()
      .mode();
   assert_eq!(mode & 0o777, 0o600);
}
