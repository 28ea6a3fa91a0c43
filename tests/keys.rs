//! Generating, finding, using and deleting keys.

mod common;

use openssl::{
    bn::BigNum,
    dsa::Dsa,
    encrypt::Encrypter,
    rsa::Padding,
    sign::Verifier,
};

use pkcs11_context::{
    DecryptPadding, Decrypter, Error, HashAlgorithm, KeyPair, Signer,
    keys::{Object, dsa::DsaParameters, ec::Curve},
    provider::{
        KeyType, ObjectClass, SessionLimit,
        mock::{MockFn, MockProvider},
    },
};

use common::{MockContext, TOKEN_LABEL};

const MESSAGE: &[u8] = b"The quick brown fox jumps over the lazy dog";

fn verify(key: &impl Signer, hash: HashAlgorithm, signature: &[u8]) -> bool {
    let mut verifier = Verifier::new(hash.message_digest(), key.public_key()).unwrap();
    verifier.update(MESSAGE).unwrap();
    verifier.verify(signature).unwrap()
}

fn sign_and_verify_all_digests(key: &impl Signer) {
    for hash in HashAlgorithm::ALL {
        let digest = hash.digest(MESSAGE).unwrap();
        let signature = key.sign(&digest, hash).unwrap();
        assert!(verify(key, hash, &signature), "{} signature does not verify", hash);
    }
}

fn find<'c>(context: &'c MockContext, id: &[u8]) -> KeyPair<'c, MockProvider> {
    context.find_key_pair(Some(id), None).unwrap().unwrap()
}

#[test]
fn rsa_sign_and_verify() {
    let (context, _library) = common::open("rsa-sign", SessionLimit::Infinite);

    let key = context.generate_rsa_key_pair(b"rsa", Some(b"rsa key"), 2048).unwrap();
    assert_eq!(2048, key.bits());
    sign_and_verify_all_digests(&key);

    let found = find(&context, b"rsa");
    assert_eq!(KeyType::Rsa, found.key_type());
    assert!(found.public_key().public_eq(key.public_key()));
    sign_and_verify_all_digests(&found);

    drop((key, found));
    context.close().unwrap();
}

#[test]
fn ec_sign_and_verify() {
    let (context, _library) = common::open("ec-sign", SessionLimit::Infinite);

    for (id, curve) in [(&b"p256"[..], Curve::P256), (&b"p384"[..], Curve::P384)] {
        let key = context.generate_ec_key_pair(id, None, curve).unwrap();
        assert_eq!(curve, key.curve());
        sign_and_verify_all_digests(&key);

        match find(&context, id) {
            KeyPair::Ec(found) => {
                assert_eq!(curve, found.curve());
                assert!(found.public_key().public_eq(key.public_key()));
                sign_and_verify_all_digests(&found);
            }
            _ => panic!("expected an EC key"),
        }
    }

    context.close().unwrap();
}

/// L2048N256 domain parameters, as generating them takes a while.
fn dsa_2048_256() -> DsaParameters {
    DsaParameters::from_components(
        BigNum::from_dec_str(concat!(
            "1711261814055840574656913422845103563294685119052214793728544209825998818225019761542708577916041042",
            "1439180425324757684372143777133652794766735361927034003821174405167502004454639027705200074749864396",
            "3221388229132337876145003700352039360726936872627235234909643419649697599019276352717235210446717681",
            "7418747043431924324099242583370939754141925455088192624586699288060591054182630749325169392661123048",
            "7275444183879966706699255763528432543168158080992127766526692139601189110012363846432577767973841827",
            "9217232444734973252015867457574965107724063826233834265321818909875712048257149552038790888980580055",
            "61306135204877009",
        ))
        .unwrap(),
        BigNum::from_dec_str("91121968019586848097218691760416459853586419261325465835456057472782359091757").unwrap(),
        BigNum::from_dec_str(concat!(
            "1144058464517446064196859090247965066514863177622621829207127746150792595358696757234573282368496884",
            "0767915723600616468676971247641561301128304315573382612091463182732020028761013121095491181166498021",
            "1611818251761285448462965323456061862144090272988739461814760410313836082598304717357831094499383726",
            "0554913508808417871425436347264703814974532950916104581862169979974103297920014019667071138441163688",
            "5603577783522623156072149396954757319730766808882432057418486340662640743658615448774457850848807133",
            "0151834036592981008527971779210997693258320196365218523553065366445657758049238058848038069627492738",
            "71634832496124563",
        ))
        .unwrap(),
    )
    .unwrap()
}

fn dsa_1024_160() -> DsaParameters {
    let params = Dsa::generate_params(1024).unwrap();
    DsaParameters::from_components(
        params.p().to_owned().unwrap(),
        params.q().to_owned().unwrap(),
        params.g().to_owned().unwrap(),
    )
    .unwrap()
}

#[test]
fn dsa_sign_and_verify() {
    let (context, _library) = common::open("dsa-sign", SessionLimit::Infinite);

    for (id, params, q_len) in [(&b"dsa1"[..], dsa_1024_160(), 20), (&b"dsa2"[..], dsa_2048_256(), 32)] {
        let key = context.generate_dsa_key_pair(id, Some(id), &params).unwrap();
        assert_eq!(q_len, key.q_len());
        sign_and_verify_all_digests(&key);

        for found in [find(&context, id), context.find_key_pair(None, Some(id)).unwrap().unwrap()] {
            assert_eq!(KeyType::Dsa, found.key_type());
            assert!(found.as_decrypter().is_none());
            assert!(found.public_key().public_eq(key.public_key()));
            sign_and_verify_all_digests(&found);
        }

        key.delete().unwrap();
        assert!(context.find_key_pair(Some(id), None).unwrap().is_none());
    }

    context.close().unwrap();
}

#[test]
fn sign_rejects_digest_of_wrong_length() {
    let (context, library) = common::open("digest-len", SessionLimit::Infinite);
    let key = context.generate_ec_key_pair(b"ec", None, Curve::P256).unwrap();

    let calls = library.calls().total();
    let err = key.sign(&[0; 20], HashAlgorithm::Sha256).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(calls, library.calls().total());

    drop(key);
    context.close().unwrap();
}

#[test]
fn rsa_decrypt() {
    let (context, _library) = common::open("rsa-decrypt", SessionLimit::Infinite);
    let key = context.generate_rsa_key_pair(b"dec", None, 2048).unwrap();
    let plaintext = b"a secret";

    for padding in [
        DecryptPadding::Pkcs1v15,
        DecryptPadding::Oaep(HashAlgorithm::Sha1),
        DecryptPadding::Oaep(HashAlgorithm::Sha256),
    ] {
        let mut encrypter = Encrypter::new(key.public_key()).unwrap();
        match padding {
            DecryptPadding::Pkcs1v15 => encrypter.set_rsa_padding(Padding::PKCS1).unwrap(),
            DecryptPadding::Oaep(hash) => {
                encrypter.set_rsa_padding(Padding::PKCS1_OAEP).unwrap();
                encrypter.set_rsa_oaep_md(hash.message_digest()).unwrap();
                encrypter.set_rsa_mgf1_md(hash.message_digest()).unwrap();
            }
        }
        let mut ciphertext = vec![0; encrypter.encrypt_len(plaintext).unwrap()];
        let len = encrypter.encrypt(plaintext, &mut ciphertext).unwrap();
        ciphertext.truncate(len);

        assert_eq!(plaintext.to_vec(), key.decrypt(&ciphertext, padding).unwrap());
    }

    let found = find(&context, b"dec");
    assert!(found.as_decrypter().is_some());

    drop((key, found));
    context.close().unwrap();
}

#[test]
fn generate_checks_arguments() {
    let (context, library) = common::open("gen-args", SessionLimit::Infinite);

    assert!(matches!(
        context.generate_rsa_key_pair(b"", None, 2048),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        context.generate_rsa_key_pair(b"id", Some(b""), 2048),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        context.generate_rsa_key_pair(b"id", None, 512),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        context.generate_ec_key_pair(b"", None, Curve::P256),
        Err(Error::InvalidArgument(_))
    ));
    let params = dsa_1024_160();
    assert!(matches!(
        context.generate_dsa_key_pair(b"", Some(b"label"), &params),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        context.generate_dsa_key_pair(b"id", Some(b""), &params),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(0, library.token(TOKEN_LABEL).unwrap().object_count());

    context.close().unwrap();
}

#[test]
fn failed_public_key_read_removes_generated_objects() {
    let (context, library) = common::open("gen-readback", SessionLimit::Infinite);
    let token = library.token(TOKEN_LABEL).unwrap().clone();

    token.set_fail_get_attributes(true);
    let err = context.generate_ec_key_pair(b"lost", None, Curve::P256).unwrap_err();
    assert!(matches!(err, Error::Token { .. }));
    assert_eq!(1, library.calls().get(MockFn::GenerateKeyPair));
    assert_eq!(2, library.calls().get(MockFn::DestroyObject));
    assert_eq!(0, token.object_count());

    token.set_fail_get_attributes(false);
    assert!(context.find_key_pair(Some(b"lost"), None).unwrap().is_none());
    context.close().unwrap();
}

#[test]
fn find_by_id_label_or_both() {
    let (context, _library) = common::open("find", SessionLimit::Infinite);
    context.generate_ec_key_pair(b"\x01", Some(b"one"), Curve::P256).unwrap();
    context.generate_ec_key_pair(b"\x02", Some(b"two"), Curve::P256).unwrap();

    let by_id = context.find_key_pair(Some(b"\x02"), None).unwrap().unwrap();
    assert_eq!(b"\x02", by_id.private_key().id());

    let by_label = context.find_key_pair(None, Some(b"one")).unwrap().unwrap();
    assert_eq!(b"\x01", by_label.private_key().id());

    let by_both = context.find_key_pair(Some(b"\x01"), Some(b"one")).unwrap();
    assert!(by_both.is_some());

    assert!(context.find_key_pair(Some(b"\x01"), Some(b"two")).unwrap().is_none());
    assert!(context.find_key_pair(Some(b"\x03"), None).unwrap().is_none());
    assert!(matches!(
        context.find_key_pair(None, None),
        Err(Error::InvalidArgument(_))
    ));

    drop((by_id, by_label, by_both));
    context.close().unwrap();
}

#[test]
fn find_reports_ambiguous_and_incomplete_key_pairs() {
    let (context, _library) = common::open("find-bad", SessionLimit::Infinite);

    context.generate_ec_key_pair(b"\x01", Some(b"same"), Curve::P256).unwrap();
    context.generate_ec_key_pair(b"\x02", Some(b"same"), Curve::P256).unwrap();
    assert!(matches!(
        context.find_key_pair(None, Some(b"same")),
        Err(Error::DuplicateKey(_))
    ));

    let key = context.generate_rsa_key_pair(b"\x03", None, 1024).unwrap();
    let public = Object::new(&context, key.private_key().public_handle());
    public.delete().unwrap();
    assert!(matches!(
        context.find_key_pair(Some(b"\x03"), None),
        Err(Error::KeyNotFound(_))
    ));

    drop(key);
    context.close().unwrap();
}

#[test]
fn delete_removes_both_objects() {
    let (context, library) = common::open("delete", SessionLimit::Infinite);
    let token = library.token(TOKEN_LABEL).unwrap().clone();

    let key = context.generate_ec_key_pair(b"del", None, Curve::P384).unwrap();
    assert_eq!(2, token.object_count());

    key.delete().unwrap();
    assert_eq!(0, token.object_count());
    assert!(context.find_key_pair(Some(b"del"), None).unwrap().is_none());

    context.close().unwrap();
}

#[test]
fn failing_private_key_delete_keeps_public_key() {
    let (context, library) = common::open("delete-fails", SessionLimit::Infinite);
    let token = library.token(TOKEN_LABEL).unwrap().clone();

    let key = context.generate_rsa_key_pair(b"keep", None, 1024).unwrap();
    token.set_fail_destroy(ObjectClass::PrivateKey, true);
    assert!(matches!(key.delete(), Err(Error::DestroyFailed(_))));
    assert_eq!(2, token.object_count());

    // Only the public key fails to go, which leaves half a key pair behind.
    token.set_fail_destroy(ObjectClass::PrivateKey, false);
    token.set_fail_destroy(ObjectClass::PublicKey, true);
    let key = find(&context, b"keep");
    assert!(matches!(key.delete(), Err(Error::DestroyFailed(_))));
    assert_eq!(1, token.object_count());
    assert!(context.find_key_pair(Some(b"keep"), None).unwrap().is_none());

    context.close().unwrap();
}

#[test]
fn keys_stop_working_when_context_closes() {
    let (context, library) = common::open("key-closed", SessionLimit::Infinite);
    let key = context.generate_ec_key_pair(b"k", None, Curve::P256).unwrap();
    let digest = HashAlgorithm::Sha256.digest(MESSAGE).unwrap();

    context.close().unwrap();
    let calls = library.calls().total();
    assert!(matches!(key.sign(&digest, HashAlgorithm::Sha256), Err(Error::Closed)));
    assert!(matches!(key.delete(), Err(Error::Closed)));
    assert_eq!(calls, library.calls().total());
}
