use bencode::{ben_bytes, ben_int, ben_list, ben_map, BDecodeOpt, BRefAccess, BencodeRef};

#[test]
fn it_should_round_trip_an_encoded_tree() {
    let message = (ben_map! {
        "announce" => ben_bytes!("udp://tracker.example.com:6969"),
        "interval" => ben_int!(1800),
        "peers" => ben_list!(ben_bytes!(vec![127, 0, 0, 1, 0x1A, 0xE1]))
    })
    .encode();

    let decoded = BencodeRef::decode(&message, BDecodeOpt::default()).unwrap();
    let dict = decoded.dict().unwrap();

    assert_eq!(
        dict.lookup(b"announce".as_slice()).unwrap().str().unwrap(),
        "udp://tracker.example.com:6969"
    );
    assert_eq!(dict.lookup(b"interval".as_slice()).unwrap().int().unwrap(), 1800);
    assert_eq!(
        dict.lookup(b"peers".as_slice()).unwrap().list().unwrap()[0].bytes().unwrap(),
        &[127, 0, 0, 1, 0x1A, 0xE1]
    );

    // Encoding what we decoded gives back the same bytes.
    assert!(decoded.is_ordered());
    assert_eq!(decoded.buffer(), &message[..]);
}

#[test]
fn it_should_emit_dict_keys_in_ascending_order() {
    let message = (ben_map! {
        "zz" => ben_int!(1),
        "a" => ben_int!(2),
        "m" => ben_int!(3)
    })
    .encode();

    let decoded = BencodeRef::decode(&message, BDecodeOpt::default()).unwrap();

    let keys: Vec<&[u8]> = decoded.dict().unwrap().to_list().into_iter().map(|(k, _)| *k).collect();
    let mut sorted = keys.clone();
    sorted.sort();

    assert_eq!(keys, sorted);
}
